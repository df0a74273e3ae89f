//! File-backed pseudonym mapping store.
//!
//! Identities are keyed by `(patient_name, birth_date)`; each distinct key
//! receives exactly one pseudonym, `PAT_<n>` where `n` is the number of
//! mappings known at assignment time plus one. The mapping file is an
//! append-only `;`-delimited flat file with a header row.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::debug;

mod anonymize;
pub use anonymize::anonymize_obj;

use crate::utils::element_str;

pub const PSEUDONYM_PREFIX: &str = "PAT";

const FIELDNAMES: [&str; 5] = ["pseudonym", "patient_name", "patient_ID", "birth_date", "sex"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not read mapping file {}: {source}", path.display()))]
    ReadMapping {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not append to mapping file {}: {source}", path.display()))]
    WriteMapping {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("mapping file {} is malformed: missing required columns", path.display()))]
    MalformedHeader { path: PathBuf },
}

/// The identity fields read from a dataset before pseudonymization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientIdentity {
    pub name: String,
    pub patient_id: String,
    pub birth_date: String,
    pub sex: String,
}

impl PatientIdentity {
    /// Extract the identity fields from a dataset, substituting `N/A` for
    /// anything absent, mirroring what ends up in the mapping file.
    pub fn from_obj(obj: &InMemDicomObject) -> Self {
        let field = |tag| element_str(obj, tag).unwrap_or_else(|| "N/A".to_string());
        PatientIdentity {
            name: field(tags::PATIENT_NAME),
            patient_id: field(tags::PATIENT_ID),
            birth_date: field(tags::PATIENT_BIRTH_DATE),
            sex: field(tags::PATIENT_SEX),
        }
    }

    fn key(&self) -> String {
        format!("{}|{}", self.name, self.birth_date)
    }
}

/// Deterministic identity → pseudonym store backed by a flat file.
///
/// The whole read-compute-append sequence runs under one lock: two
/// concurrent calls for unseen identities would otherwise both derive the
/// same sequence number and break the one-pseudonym-per-identity invariant.
pub struct PseudonymStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PseudonymStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PseudonymStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the pseudonym for this identity, assigning and persisting a
    /// new one if the identity has never been seen.
    ///
    /// I/O failures are propagated: losing consistency of the mapping file
    /// is worse than failing the call.
    pub async fn resolve_or_create(&self, identity: &PatientIdentity) -> Result<String, Error> {
        let _guard = self.lock.lock().await;

        let mappings = self.read_mappings()?;
        if let Some(pseudonym) = mappings.get(&identity.key()) {
            return Ok(pseudonym.clone());
        }

        let pseudonym = format!("{}_{:04}", PSEUDONYM_PREFIX, mappings.len() + 1);
        self.append_row(&pseudonym, identity)?;
        debug!(pseudonym, patient = %identity.name, "assigned new pseudonym");
        Ok(pseudonym)
    }

    /// Read the whole mapping file into a key → pseudonym map. An absent
    /// file is an empty store.
    fn read_mappings(&self) -> Result<HashMap<String, String>, Error> {
        let mut mappings = HashMap::new();
        if !self.path.exists() {
            return Ok(mappings);
        }
        let content = std::fs::read_to_string(&self.path).context(ReadMappingSnafu {
            path: self.path.clone(),
        })?;

        let mut lines = content.lines();
        let header: Vec<&str> = match lines.next() {
            Some(line) => line.split(';').collect(),
            None => return Ok(mappings),
        };
        let column = |name: &str| header.iter().position(|h| *h == name);
        let (pseudo_col, name_col, birth_col) = match (
            column("pseudonym"),
            column("patient_name"),
            column("birth_date"),
        ) {
            (Some(p), Some(n), Some(b)) => (p, n, b),
            _ => {
                return MalformedHeaderSnafu {
                    path: self.path.clone(),
                }
                .fail()
            }
        };

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(';').collect();
            let (pseudonym, name, birth) = match (
                fields.get(pseudo_col),
                fields.get(name_col),
                fields.get(birth_col),
            ) {
                (Some(p), Some(n), Some(b)) => (p, n, b),
                _ => continue,
            };
            mappings.insert(format!("{name}|{birth}"), pseudonym.to_string());
        }
        Ok(mappings)
    }

    fn append_row(&self, pseudonym: &str, identity: &PatientIdentity) -> Result<(), Error> {
        let needs_header = !self.path.exists()
            || std::fs::metadata(&self.path)
                .map(|m| m.len() == 0)
                .unwrap_or(true);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(WriteMappingSnafu {
                path: self.path.clone(),
            })?;

        let mut row = String::new();
        if needs_header {
            row.push_str(&FIELDNAMES.join(";"));
            row.push('\n');
        }
        row.push_str(&format!(
            "{};{};{};{};{}\n",
            pseudonym, identity.name, identity.patient_id, identity.birth_date, identity.sex
        ));
        file.write_all(row.as_bytes()).context(WriteMappingSnafu {
            path: self.path.clone(),
        })?;
        Ok(())
    }
}

/// Replace the patient name with a stable pseudonym and blank the
/// birth-date and sex attributes in place.
///
/// A dataset without a patient name is left untouched.
pub async fn pseudonymize_obj(
    store: &PseudonymStore,
    obj: &mut InMemDicomObject,
) -> Result<(), Error> {
    if obj.element(tags::PATIENT_NAME).is_err() {
        return Ok(());
    }
    let identity = PatientIdentity::from_obj(obj);
    let pseudonym = store.resolve_or_create(&identity).await?;

    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(pseudonym),
    ));
    for (tag, vr) in [(tags::PATIENT_BIRTH_DATE, VR::DA), (tags::PATIENT_SEX, VR::CS)] {
        if obj.element(tag).is_ok() {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
        }
    }
    Ok(())
}
