//! # Accessor Derive
//!
//! Generates by-value getters and chained setters for the named fields of
//! plain configuration structs.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive `<field>(&self) -> Ty`, `set_<field>(&mut self, Ty) -> &mut Self`
/// and `const with_<field>(self, Ty) -> Self` for each named field.
///
/// Getters copy the field out and are `const`, so fields without a
/// `#[setters(no_get)]` attribute must be `Copy`.
///
/// - Skipping a field entirely: `#[setters(skip)]`
/// - Setters only, no getter: `#[setters(no_get)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Limits {
///     pages: u32,
///     #[setters(no_get)]
///     name: &'static str,
///     #[setters(skip)]
///     scratch: u8,
/// }
///
/// let mut l = Limits { pages: 1, name: "a", scratch: 0 };
/// l.set_pages(10).set_name("b");
/// let l = l.with_pages(42);
/// assert_eq!(l.pages(), 42);
/// assert_eq!(l.name, "b");
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            other => {
                return syn::Error::new(other.span(), "Setters needs named fields")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();
    for field in &fields {
        let options = match FieldOptions::parse(field) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }
        let Some(name) = &field.ident else { continue };
        let ty = &field.ty;
        let set_name = format_ident!("set_{}", name);
        let with_name = format_ident!("with_{}", name);

        if options.getter {
            methods.push(quote! {
                #[inline]
                #[must_use]
                pub const fn #name(&self) -> #ty {
                    self.#name
                }
            });
        }

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#name = value;
                self
            }

            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#name = value;
                self
            }
        });
    }

    TokenStream::from(quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    })
}

struct FieldOptions {
    skip: bool,
    getter: bool,
}

impl FieldOptions {
    /// Reads `#[setters(skip)]`, `#[setters(skip = bool)]` and
    /// `#[setters(no_get)]`.
    fn parse(field: &Field) -> syn::Result<Self> {
        let mut options = Self {
            skip: false,
            getter: true,
        };
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("setters")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = if meta.input.is_empty() {
                        true
                    } else {
                        meta.value()?.parse::<LitBool>()?.value
                    };
                    Ok(())
                } else if meta.path.is_ident("no_get") {
                    options.getter = false;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `no_get`"))
                }
            })?;
        }
        Ok(options)
    }
}
