//! Per-context-kind options validation: a fixed allow/require/forbid matrix
//! applied once, at context `init`.

#![deny(unsafe_code)]

use fle_core::Error;

/// Which shape of operation a context drives, for the purpose of options
/// validation. `encrypt (auto)` and `encrypt (explicit)` are split because
/// they accept disjoint option sets even though both produce a `Context` of
/// kind `Encrypt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Non-explicit (schema-driven) encrypt.
    EncryptAuto,
    /// Explicit, caller-addressed encrypt.
    EncryptExplicit,
    /// Auto or explicit decrypt (the matrix is identical for both).
    Decrypt,
    /// Data key creation.
    CreateDataKey,
}

impl ContextKind {
    fn label(self) -> &'static str {
        match self {
            Self::EncryptAuto => "auto encryption",
            Self::EncryptExplicit => "explicit encryption",
            Self::Decrypt => "decryption",
            Self::CreateDataKey => "data key creation",
        }
    }

    fn requirement(self, field: OptField) -> Requirement {
        use ContextKind::{CreateDataKey, Decrypt, EncryptAuto, EncryptExplicit};
        use OptField::{Algorithm, Iv, KeyDescriptor, MasterKey, Schema};
        use Requirement::{Optional, Prohibited, Required};

        match (self, field) {
            (EncryptAuto, MasterKey) => Prohibited,
            (EncryptAuto, Schema) => Optional,
            (EncryptAuto, KeyDescriptor) => Prohibited,
            (EncryptAuto, Iv) => Prohibited,
            (EncryptAuto, Algorithm) => Prohibited,

            (EncryptExplicit, MasterKey) => Prohibited,
            (EncryptExplicit, Schema) => Prohibited,
            (EncryptExplicit, KeyDescriptor) => Required,
            (EncryptExplicit, Iv) => Optional,
            (EncryptExplicit, Algorithm) => Required,

            (Decrypt, MasterKey) => Prohibited,
            (Decrypt, Schema) => Prohibited,
            (Decrypt, KeyDescriptor) => Prohibited,
            (Decrypt, Iv) => Prohibited,
            (Decrypt, Algorithm) => Prohibited,

            (CreateDataKey, MasterKey) => Required,
            (CreateDataKey, Schema) => Prohibited,
            (CreateDataKey, KeyDescriptor) => Prohibited,
            (CreateDataKey, Iv) => Prohibited,
            (CreateDataKey, Algorithm) => Prohibited,
        }
    }
}

/// An option field covered by the validation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptField {
    /// KMS master key description (required only for data key creation).
    MasterKey,
    /// A locally supplied JSON-schema for auto encryption.
    Schema,
    /// Explicit key id or alt-name descriptor.
    KeyDescriptor,
    /// Caller-supplied initialization vector.
    Iv,
    /// Explicit algorithm selection.
    Algorithm,
}

impl OptField {
    fn label(self) -> &'static str {
        match self {
            Self::MasterKey => "masterkey",
            Self::Schema => "schema",
            Self::KeyDescriptor => "key_id",
            Self::Iv => "iv",
            Self::Algorithm => "algorithm",
        }
    }
}

/// Whether a field must be absent, must be present, or may be either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Must not be set.
    Prohibited,
    /// Must be set.
    Required,
    /// May be set or omitted.
    Optional,
}

/// Which of the validated option fields the caller actually supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvidedOpts {
    /// `masterkey` was supplied.
    pub masterkey: bool,
    /// `schema` (local JSON-schema) was supplied.
    pub schema: bool,
    /// `key_id` or `key_alt_name` was supplied.
    pub key_descriptor: bool,
    /// `iv` was supplied.
    pub iv: bool,
    /// `algorithm` was supplied.
    pub algorithm: bool,
}

impl ProvidedOpts {
    fn is_present(self, field: OptField) -> bool {
        match field {
            OptField::MasterKey => self.masterkey,
            OptField::Schema => self.schema,
            OptField::KeyDescriptor => self.key_descriptor,
            OptField::Iv => self.iv,
            OptField::Algorithm => self.algorithm,
        }
    }
}

const ALL_FIELDS: [OptField; 5] =
    [OptField::MasterKey, OptField::Schema, OptField::KeyDescriptor, OptField::Iv, OptField::Algorithm];

/// Validate `opts` against the matrix for `kind`, returning the first
/// violation found (fields are checked in a fixed order so errors are
/// deterministic).
pub fn validate(kind: ContextKind, opts: ProvidedOpts) -> Result<(), Error> {
    for field in ALL_FIELDS {
        let present = opts.is_present(field);
        match kind.requirement(field) {
            Requirement::Prohibited if present => {
                return Err(Error::ClientInput(format!(
                    "{} must not be set for {}",
                    field.label(),
                    kind.label()
                )))
            }
            Requirement::Required if !present => {
                return Err(Error::ClientInput(format!(
                    "{} must be set for {}",
                    field.label(),
                    kind.label()
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_encrypt_rejects_key_descriptor() {
        let opts = ProvidedOpts { key_descriptor: true, ..Default::default() };
        let err = validate(ContextKind::EncryptAuto, opts).unwrap_err();
        assert_eq!(err, Error::ClientInput("key_id must not be set for auto encryption".to_string()));
    }

    #[test]
    fn auto_encrypt_allows_bare_schema() {
        let opts = ProvidedOpts { schema: true, ..Default::default() };
        assert!(validate(ContextKind::EncryptAuto, opts).is_ok());
    }

    #[test]
    fn explicit_encrypt_requires_key_and_algorithm() {
        let err = validate(ContextKind::EncryptExplicit, ProvidedOpts::default()).unwrap_err();
        assert_eq!(err, Error::ClientInput("key_id must be set for explicit encryption".to_string()));
    }

    #[test]
    fn decrypt_prohibits_everything() {
        assert!(validate(ContextKind::Decrypt, ProvidedOpts::default()).is_ok());
        let opts = ProvidedOpts { iv: true, ..Default::default() };
        assert!(validate(ContextKind::Decrypt, opts).is_err());
    }

    #[test]
    fn data_key_requires_masterkey() {
        assert!(validate(ContextKind::CreateDataKey, ProvidedOpts::default()).is_err());
        let opts = ProvidedOpts { masterkey: true, ..Default::default() };
        assert!(validate(ContextKind::CreateDataKey, opts).is_ok());
    }
}
