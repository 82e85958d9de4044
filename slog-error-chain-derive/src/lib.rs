use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

#[proc_macro_derive(SlogInlineError)]
pub fn derive_slog_inline_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) =
        input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics slog::Value for #name #ty_generics #where_clause {
            fn serialize(
                &self,
                _record: &slog::Record,
                key: slog::Key,
                serializer: &mut dyn slog::Serializer,
            ) -> slog::Result {
                let mut msg = std::string::ToString::to_string(self);
                let mut cause = std::error::Error::source(self);
                while let Some(err) = cause {
                    msg.push_str(": ");
                    msg.push_str(&err.to_string());
                    cause = err.source();
                }
                serializer.emit_arguments(key, &format_args!("{msg}"))
            }
        }
    };
    expanded.into()
}
