pub use revgrad_internal::*;
