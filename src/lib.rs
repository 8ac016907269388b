//! NLP batch parser poller
//!
//! Claims gzip-compressed text batches from an S3 inbox, runs them through
//! Stanford CoreNLP, and republishes the annotated XML with a per-run
//! manifest. Competing consumers coordinate only through the object store's
//! copy/delete semantics.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
