use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, FieldsNamed};

use crate::get_header_field;

pub fn derive_serializable(input: &DeriveInput, fields: &FieldsNamed) -> TokenStream {
	let ident = &input.ident;
	let header = get_header_field(fields).ident.as_ref().expect("Missing field name");
	let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

	quote! {
		#[automatically_derived]
		impl #impl_generics ::ser_graph::Serializable for #ident #type_generics #where_clause {
			#[inline]
			fn header(&self) -> &::ser_graph::ObjectHeader {
				&self.#header
			}

			#[inline]
			fn header_mut(&mut self) -> &mut ::ser_graph::ObjectHeader {
				&mut self.#header
			}

			#[inline]
			fn as_any(&self) -> &dyn ::core::any::Any {
				self
			}

			#[inline]
			fn as_any_mut(&mut self) -> &mut dyn ::core::any::Any {
				self
			}
		}
	}
}
