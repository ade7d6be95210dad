//! HPACK integration tests

mod interop;
