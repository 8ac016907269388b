use std::fmt;

/// Published documents land under `xml/{document-id}/{sub-id}.xml`.
pub const OUTPUT_PREFIX: &str = "xml/";
pub const OUTPUT_EXTENSION: &str = ".xml";

/// Identity decoded from an annotated output filename.
///
/// The engine names outputs `{document-id}_{sub-id}.xml`; downstream readers
/// parse the published key back, so the convention is strict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputId {
    pub document_id: String,
    pub sub_id: String,
}

impl OutputId {
    pub fn from_file_name(name: &str) -> Result<Self, OutputNameError> {
        let stem = name
            .strip_suffix(OUTPUT_EXTENSION)
            .ok_or_else(|| OutputNameError::MissingExtension(name.to_string()))?;

        let mut parts = stem.split('_');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(doc), Some(sub), None)
                if !doc.is_empty() && !sub.is_empty() && !doc.contains('/') && !sub.contains('/') =>
            {
                Ok(Self {
                    document_id: doc.to_string(),
                    sub_id: sub.to_string(),
                })
            }
            _ => Err(OutputNameError::BadShape(name.to_string())),
        }
    }

    pub fn destination_key(&self) -> String {
        format!(
            "{}{}/{}{}",
            OUTPUT_PREFIX, self.document_id, self.sub_id, OUTPUT_EXTENSION
        )
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.document_id, self.sub_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputNameError {
    #[error("Output file {0:?} does not end in .xml")]
    MissingExtension(String),

    #[error("Output file {0:?} is not named {{document-id}}_{{sub-id}}.xml")]
    BadShape(String),
}
