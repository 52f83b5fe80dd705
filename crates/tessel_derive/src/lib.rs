use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod ops;

/// Forwards [`TensorOp`] to the single field marked with `#[tensor_op]`
/// (or to the only field of a tuple struct).
///
/// Container attributes:
/// - `#[tensor_op(crate = "crate")]` sets the path of the `tessel` crate.
/// - `#[tensor_op(bound = "T: Float")]` adds predicates to the generated `where` clause.
#[proc_macro_derive(TensorOp, attributes(tensor_op))]
pub fn derive_tensor_op(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_tensor_op(input);
    expanded.into()
}
