//! Example protocols built on the connection API.
//!
//! - `echo`: line and length-prefixed echo, used by the `nbsock-echo` binary

pub mod echo;
