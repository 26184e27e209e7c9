//! DWARF unwind support: building a function's FDE ([`fde`]) and indexing
//! every live function's FDE for concurrent lookup during unwinding
//! ([`table`]). See `spec.md` §4.I.

pub mod fde;
pub mod table;

pub use fde::{build_fde, create_cie, write_frame_table, FrameShape};
pub use table::FdeTable;
