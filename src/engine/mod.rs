// Own-order bookkeeping and shared domain types
pub mod book;   // the trader's own working limit orders
pub mod types;  // orders, price levels, instruments
