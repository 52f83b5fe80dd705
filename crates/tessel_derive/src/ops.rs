use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

/// Options collected from the container-level `#[tensor_op(...)]` attributes.
#[derive(Default)]
struct Options {
    krate: Option<Path>,
    name: Option<LitStr>,
    bounds: Punctuated<WherePredicate, Token![,]>,
}

impl Options {
    fn parse(input: &DeriveInput) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in input
            .attrs
            .iter()
            .filter(|attr| attr.path().is_ident("tensor_op"))
        {
            attr.parse_nested_meta(|meta| {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                if meta.path.is_ident("crate") {
                    options.krate = Some(s.parse()?);
                } else if meta.path.is_ident("bound") {
                    let predicates = s
                        .parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                    options.bounds.extend(predicates);
                } else if meta.path.is_ident("name") {
                    options.name = Some(s);
                } else {
                    return Err(meta.error(
                        "unexpected attribute; supported are `crate`, `bound` and `name`",
                    ));
                }
                Ok(())
            })?;
        }
        Ok(options)
    }
}

/// Finds the expression the trait is forwarded to.
fn forward_field(input: &DeriveInput) -> syn::Result<TokenStream> {
    let fields = match &input.data {
        syn::Data::Struct(data) => &data.fields,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "`TensorOp` can only be derived for structs",
            ));
        }
    };

    match fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(quote! { self.0 }),
        Fields::Unnamed(fields) => Err(syn::Error::new(
            fields.span(),
            "tuple structs must have exactly one field",
        )),
        Fields::Named(fields) => {
            let marked: Vec<_> = fields
                .named
                .iter()
                .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("tensor_op")))
                .collect();
            match marked.as_slice() {
                [field] => {
                    let ident = &field.ident;
                    Ok(quote! { self.#ident })
                }
                [] => Err(syn::Error::new(
                    fields.span(),
                    "no field marked with #[tensor_op] attribute",
                )),
                _ => Err(syn::Error::new(
                    fields.span(),
                    "multiple fields marked with #[tensor_op] attribute",
                )),
            }
        }
        Fields::Unit => Err(syn::Error::new(
            input.span(),
            "unit structs are not supported by `TensorOp` derive",
        )),
    }
}

pub fn derive_tensor_op(input: DeriveInput) -> TokenStream {
    let forward = match forward_field(&input) {
        Ok(forward) => forward,
        Err(err) => return err.to_compile_error(),
    };
    let Options {
        krate,
        name,
        bounds,
    } = match Options::parse(&input) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error(),
    };

    let base_path = match krate {
        Some(path) => quote!(#path::loom::ops),
        None => quote!(::tessel::loom::ops),
    };

    let ident = &input.ident;
    let (impl_generics, ty_generics, _) = input.generics.split_for_impl();
    let mut generics = input.generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(bounds);

    let name = name.map(|name| {
        quote! {
            #[inline]
            fn name(&self) -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed(#name)
            }
        }
    });

    quote! {
        impl #impl_generics #base_path::TensorOp for #ident #ty_generics #where_clause {
            #name

            #[inline]
            fn io(&self) -> Vec<#base_path::TileIr> {
                #base_path::TensorOp::io(&#forward)
            }
        }
    }
}
