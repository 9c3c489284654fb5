use syn::{parse_macro_input, Data, DataStruct, DeriveInput, Field, Fields, FieldsNamed};

mod layout;
use layout::derive_layout;
mod serializable;
use serializable::derive_serializable;

/// Implement `Serializable` for a struct with an `ObjectHeader` field.
///
/// Header field is the field named `header`, or the field marked
/// `#[serializable(header)]`.
#[proc_macro_derive(Serializable, attributes(serializable))]
pub fn serializable(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let input = parse_macro_input!(input as DeriveInput);
	let fields = get_named_fields(&input.data, "Serializable");
	derive_serializable(&input, fields).into()
}

/// Implement `HasLayout` for a `#[repr(C)]` struct.
///
/// Field kinds: `ObjPtr<_>` fields are object pointers, fields marked
/// `#[layout(extra)]` are extra-data pointers, fields marked
/// `#[layout(count = "len")]` are extra-data arrays with length in field
/// `len`. All other fields are plain data. Header field is omitted.
#[proc_macro_derive(Layout, attributes(layout))]
pub fn layout(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let input = parse_macro_input!(input as DeriveInput);
	let fields = get_named_fields(&input.data, "Layout");
	derive_layout(&input, fields).into()
}

fn get_named_fields<'a>(data: &'a Data, derive_name: &str) -> &'a FieldsNamed {
	match data {
		Data::Struct(DataStruct {
			fields: Fields::Named(fields),
			..
		}) => fields,
		_ => panic!("Deriving `{}` only supported on structs with named fields", derive_name),
	}
}

/// Find the header field.
fn get_header_field(fields: &FieldsNamed) -> &Field {
	let marked = fields
		.named
		.iter()
		.filter(|field| has_header_attr(field))
		.collect::<Vec<_>>();
	match marked.len() {
		0 => {}
		1 => return marked[0],
		_ => panic!("Can only have one `#[serializable(header)]` field"),
	}

	fields
		.named
		.iter()
		.find(|field| field.ident.as_ref().map_or(false, |ident| ident == "header"))
		.expect("No header field. Name it `header` or mark it `#[serializable(header)]`")
}

fn has_header_attr(field: &Field) -> bool {
	field.attrs.iter().any(|attr| {
		attr.path.is_ident("serializable")
			&& attr
				.parse_args::<syn::Ident>()
				.map_or(false, |ident| ident == "header")
	})
}
