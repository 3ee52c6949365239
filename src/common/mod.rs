//! Miscellaneous common structs used throughout the library.

mod bucket;
mod contact;
mod id;
mod lookup_list;
pub mod messages;
mod routing_table;

pub use bucket::*;
pub use contact::*;
pub use id::*;
pub use lookup_list::*;
pub use messages::*;
pub use routing_table::*;
