use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

pub fn derive_component(input: TokenStream) -> TokenStream {
    // Parse the input tokens into a syntax tree
    let ast = parse_macro_input!(input as DeriveInput);

    // Get the struct name we are annotating
    let struct_name = &ast.ident;

    // Use ::quarry_engine::ecs::component::Component which works both inside and outside the
    // crate. Inside the crate this resolves because of `extern crate self as quarry_engine;`
    // in lib.rs. Outside the crate it naturally resolves to the quarry_engine dependency.
    TokenStream::from(quote! {
        impl ::quarry_engine::ecs::component::Component for #struct_name {
        }
    })
}
