mod arithmetic;
pub mod broadcasting;
mod inplace;
mod transform;
