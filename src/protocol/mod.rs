pub mod codec;
pub(crate) mod record;

pub use record::{Ack, Descriptor, Reply};
