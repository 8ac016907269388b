//! Batch fixtures shared by the poller tests

/// A batch as an upstream producer would upload it.
#[derive(Debug, Clone)]
pub struct BatchFixture {
    pub key: &'static str,
    pub docs: &'static [(&'static str, &'static str)],
    pub description: &'static str,
}

pub const TWO_DOC_BATCH: BatchFixture = BatchFixture {
    key: "text_events/batch1.tgz",
    docs: &[
        ("a", "The quick brown fox jumps over the lazy dog."),
        ("b", "Colorless green ideas sleep furiously."),
    ],
    description: "Two short documents, one sentence each",
};

pub const SINGLE_DOC_BATCH: BatchFixture = BatchFixture {
    key: "text_events/batch2.tgz",
    docs: &[("doc42", "Buffalo buffalo Buffalo buffalo buffalo buffalo Buffalo buffalo.")],
    description: "One document with a numeric-suffixed id",
};
