use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod ops;

/// Implements `TaskOp` by forwarding `io` to the field marked `#[task_op]`,
/// or to the only field of a tuple struct.
///
/// Container attribute `#[task_op(crate = "...", bound = "...", name = "...")]`:
/// `crate` is the path of the `tessera` crate, `bound` adds where-predicates to the impl,
/// and `name` replaces the type name reported by `TaskOp::name`.
#[proc_macro_derive(TaskOp, attributes(task_op))]
pub fn derive_task_op(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_task_op(input);
    expanded.into()
}
