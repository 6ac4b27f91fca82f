pub mod client;
pub mod extraction;
pub mod invoice;
