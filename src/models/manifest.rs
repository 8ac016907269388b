use super::run::RunSignature;

/// One object per successful run; its presence is the commit record.
pub const MANIFEST_PREFIX: &str = "data_events/";

/// Ordered list of output keys published by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub signature: RunSignature,
    pub keys: Vec<String>,
}

impl Manifest {
    pub fn key(&self) -> String {
        self.signature.manifest_key()
    }

    /// Newline-joined keys, no trailing newline.
    pub fn body(&self) -> String {
        self.keys.join("\n")
    }

    pub fn parse_body(body: &str) -> Vec<String> {
        body.lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}
