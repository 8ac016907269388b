pub mod attempt;
pub mod batch;
pub mod manifest;
pub mod output;
pub mod run;
