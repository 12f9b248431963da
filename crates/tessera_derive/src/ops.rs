use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

pub fn derive_task_op(input: DeriveInput) -> TokenStream {
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`TaskOp` can only be derived for structs")
                .to_compile_error();
        }
    };

    // the expression `io` is forwarded to
    let forward_access = match fields {
        // a newtype over the inner op
        Fields::Unnamed(fields_unnamed) => {
            if fields_unnamed.unnamed.len() != 1 {
                return syn::Error::new(
                    fields_unnamed.span(),
                    "tuple structs must have exactly one field",
                )
                .to_compile_error();
            }
            quote! { self.0 }
        }
        // the inner op plus scalar arguments of the codelet
        Fields::Named(fields_named) => {
            let marked_fields: Vec<_> = fields_named
                .named
                .iter()
                .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("task_op")))
                .collect();

            if marked_fields.len() != 1 {
                let msg = match marked_fields.len() {
                    0 => "no field marked with #[task_op] attribute",
                    _ => "multiple fields marked with #[task_op] attribute",
                };
                return syn::Error::new(fields_named.span(), msg).to_compile_error();
            }

            let field_ident = &marked_fields[0].ident;
            quote! { self.#field_ident }
        }
        Fields::Unit => {
            return syn::Error::new(input.span(), "unit structs are not supported by `TaskOp` derive")
                .to_compile_error();
        }
    };

    let name = input.ident;

    // container attributes: `crate = "..."`, `bound = "..."` and `name = "..."`
    let mut crate_name = None;
    let mut op_name = None;
    let mut user_bounds = Punctuated::<WherePredicate, Token![,]>::new();
    for attr in &input.attrs {
        if !attr.path().is_ident("task_op") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("bound") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                let predicates =
                    s.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                user_bounds.extend(predicates);
                Ok(())
            } else if meta.path.is_ident("name") {
                let value = meta.value()?;
                op_name = Some(value.parse::<LitStr>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate`, `bound` and `name`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::ops),
        None => quote!(::tessera::loom::ops),
    };

    // shows up in logs and submission errors instead of the full type name
    let name_fn = op_name.map(|op_name| {
        quote! {
            fn name(&self) -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed(#op_name)
            }
        }
    });

    let generics = &input.generics;
    let (impl_generics, ty_generics, _) = generics.split_for_impl();

    let mut generics = generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(user_bounds);

    quote! {
        impl #impl_generics #base_path::TaskOp for #name #ty_generics #where_clause {
            #name_fn

            fn io(&self) -> Vec<#base_path::TaskIr> {
                #base_path::TaskOp::io(&#forward_access)
            }
        }
    }
}
