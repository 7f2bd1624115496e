// Market data module entrypoint
pub mod adapters;       // upstream venue connectors (simulated for the demo)
pub mod aggregator;     // per-consumer ladder merging venue book + own orders
pub mod external_book;  // in-memory representation of a venue ladder
pub mod instruments;    // symbol -> instrument resolution
pub mod normaliser;     // price/quantity formatting and venue codes
pub mod router;         // pumps upstream events into a multiplexer
pub mod unified_book;   // two-sequence merge of own levels into the ladder
