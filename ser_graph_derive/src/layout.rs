use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
	spanned::Spanned, DeriveInput, Field, FieldsNamed, Lit, Meta, MetaList, MetaNameValue, NestedMeta,
	PathArguments, Type,
};

use crate::get_header_field;

/// Kind of a field, from its type and `#[layout]` attribute.
enum Kind {
	Plain,
	ObjectPtr,
	ExtraPtr,
	ExtraArray(String),
}

pub fn derive_layout(input: &DeriveInput, fields: &FieldsNamed) -> TokenStream {
	let ident = &input.ident;
	let name = ident.to_string();
	let header = get_header_field(fields).ident.as_ref();

	let field_exprs: Vec<TokenStream> = fields
		.named
		.iter()
		.filter(|field| field.ident.as_ref() != header)
		.map(get_field_expr)
		.collect();

	let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

	quote! {
		#[automatically_derived]
		impl #impl_generics ::ser_graph::HasLayout for #ident #type_generics #where_clause {
			fn layout() -> ::ser_graph::LayoutTable {
				::ser_graph::LayoutTable::of::<Self>(#name)
					#(#field_exprs)*
			}
		}
	}
}

fn get_field_expr(field: &Field) -> TokenStream {
	let field_ident = field.ident.as_ref().expect("Missing field name");
	let field_name = field_ident.to_string();
	let ty = &field.ty;

	let kind = match get_kind(field) {
		Kind::Plain => quote! { ::ser_graph::FieldKind::Plain },
		Kind::ObjectPtr => quote! { ::ser_graph::FieldKind::ObjectPtr },
		Kind::ExtraPtr => quote! { ::ser_graph::FieldKind::ExtraPtr },
		Kind::ExtraArray(count_field) => quote! {
			::ser_graph::FieldKind::ExtraArray {
				count_field: ::std::string::String::from(#count_field),
			}
		},
	};

	quote_spanned! {field.span()=>
		.field(
			#field_name,
			::core::mem::offset_of!(Self, #field_ident),
			::core::mem::size_of::<#ty>(),
			#kind,
		)
	}
}

fn get_kind(field: &Field) -> Kind {
	let attrs = field
		.attrs
		.iter()
		.filter(|attr| attr.path.is_ident("layout"))
		.map(|attr| attr.parse_meta().expect("Malformed `layout` attr"))
		.collect::<Vec<_>>();

	if attrs.len() > 1 {
		panic!("Cannot have more than 1 `#[layout]` attribute on a field");
	}

	if let Some(attr) = attrs.into_iter().next() {
		if let Meta::List(MetaList { nested, .. }) = attr {
			let parts: Vec<NestedMeta> = nested.into_iter().collect();
			if parts.len() == 1 {
				match parts.into_iter().next() {
					Some(NestedMeta::Meta(Meta::Path(path))) if path.is_ident("extra") => {
						return Kind::ExtraPtr;
					}
					Some(NestedMeta::Meta(Meta::NameValue(MetaNameValue {
						path,
						lit: Lit::Str(count),
						..
					}))) if path.is_ident("count") => {
						return Kind::ExtraArray(count.value());
					}
					_ => {}
				}
			}
		}
		panic!("`#[layout]` needs `extra` or `count = \"field\"` e.g. `#[layout(count = \"len\")]`");
	}

	if is_obj_ptr(&field.ty) {
		Kind::ObjectPtr
	} else {
		Kind::Plain
	}
}

/// Whether type is `ObjPtr<T>` (with any path prefix).
fn is_obj_ptr(ty: &Type) -> bool {
	match ty {
		Type::Path(type_path) => type_path.path.segments.last().map_or(false, |segment| {
			segment.ident == "ObjPtr" && matches!(segment.arguments, PathArguments::AngleBracketed(_))
		}),
		_ => false,
	}
}
