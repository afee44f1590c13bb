//! Derive macros for the packet codec traits in the `minecraft` crate.
//!
//! Packets are flat structs of wire fields read and written in declaration
//! order, so both derives expand to one `read_field`/`write_field` call per
//! field against the surrounding crate's `MinecraftStream`/`Buffer` types.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Field, Fields};

fn named_fields(input: &DeriveInput) -> Vec<&Field> {
    match input.data {
        Data::Struct(ref data) => match data.fields {
            Fields::Named(ref fields) => fields.named.iter().collect(),
            Fields::Unit => Vec::new(),
            Fields::Unnamed(_) => panic!("packet fields must be named"),
        },
        _ => panic!("packets must be structs"),
    }
}

#[proc_macro_derive(PacketDeserializer)]
pub fn packet_deserializer_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = &input.ident;
    let fields = named_fields(&input);

    let field_names: Vec<_> = fields.iter().map(|f| &f.ident).collect();
    let field_types: Vec<_> = fields.iter().map(|f| &f.ty).collect();

    let gen = quote! {
        impl PacketDeserializer for #struct_name {
            // packets with no fields leave `stream` untouched
            #[allow(unused_variables)]
            fn from_raw<RW: AsyncRead + AsyncWrite + Unpin>(stream: &mut MinecraftStream<RW>) -> Result<Self, ReadingError> {
                #(let #field_names = stream.read_field::<#field_types>()?;)*

                Ok(#struct_name {
                    #(#field_names),*
                })
            }
        }
    };

    gen.into()
}

#[proc_macro_derive(PacketSerializer)]
pub fn packet_serializer_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = &input.ident;
    let fields = named_fields(&input);

    let field_names: Vec<_> = fields.iter().map(|f| &f.ident).collect();
    let field_types: Vec<_> = fields.iter().map(|f| &f.ty).collect();

    let gen = quote! {
        impl PacketSerializer for #struct_name {
            #[allow(unused_variables)]
            fn to_raw(&self, stream: &mut Buffer) -> Option<()> {
                #(stream.write_field::<#field_types>(&self.#field_names)?;)*

                Some(())
            }
        }
    };

    gen.into()
}
