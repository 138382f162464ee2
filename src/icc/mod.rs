pub mod dns;
pub mod network;
pub mod resolv;
