// Subscription multiplexing: who wants which data, and which feeds are open
pub mod error;        // upstream + activation errors
pub mod multiplexer;  // subscribe / unsubscribe / instrument change / fan-out
pub mod reference;    // ref-counted upstream feeds per key
pub mod subscription; // consumer fields per data kind
pub mod types;        // data kinds, keys, consumer trait

pub use multiplexer::Multiplexer;
