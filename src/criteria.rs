//! Search criteria for query/retrieve operations.

/// Query/retrieve hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryLevel {
    #[default]
    Study,
    Series,
    Image,
}

impl QueryLevel {
    /// The value placed in the `QueryRetrieveLevel` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

/// De-identification applied to received files. Anonymization takes
/// precedence when both flags are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeidentMode {
    #[default]
    None,
    Anonymize,
    Pseudonymize,
}

/// One query, built once and not mutated afterwards (the orchestrator may
/// force the level when deriving a retrieval from a search match, which is
/// why `level` stays writable).
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub level: QueryLevel,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub series_description: Option<String>,
    pub accession_number: Option<String>,
    pub modality: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    /// Strip demographics irreversibly from received files.
    pub anonymize: bool,
    /// Replace the patient name with a stable pseudonym from the mapping
    /// store.
    pub pseudonymize: bool,
}

impl SearchCriteria {
    /// A series-level query by patient ID and series description, the shape
    /// the batch coordinator issues for each catalog pattern.
    pub fn series(patient_id: impl Into<String>, series_description: impl Into<String>) -> Self {
        SearchCriteria {
            level: QueryLevel::Series,
            patient_id: Some(patient_id.into()),
            series_description: Some(series_description.into()),
            ..Default::default()
        }
    }

    /// A series-level retrieval for one concrete (study, series) pair,
    /// keeping this query's de-identification flags.
    pub fn retrieval_for(&self, study_instance_uid: String, series_instance_uid: String) -> Self {
        SearchCriteria {
            level: QueryLevel::Series,
            study_instance_uid: Some(study_instance_uid),
            series_instance_uid: Some(series_instance_uid),
            anonymize: self.anonymize,
            pseudonymize: self.pseudonymize,
            ..Default::default()
        }
    }

    /// Resolve the de-identification flags; anonymize wins over
    /// pseudonymize.
    pub fn deident_mode(&self) -> DeidentMode {
        if self.anonymize {
            DeidentMode::Anonymize
        } else if self.pseudonymize {
            DeidentMode::Pseudonymize
        } else {
            DeidentMode::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymize_overrides_pseudonymize() {
        let criteria = SearchCriteria {
            anonymize: true,
            pseudonymize: true,
            ..Default::default()
        };
        assert_eq!(criteria.deident_mode(), DeidentMode::Anonymize);
    }

    #[test]
    fn retrieval_criteria_keep_deident_flags() {
        let mut base = SearchCriteria::series("PAT1", "T2mapping");
        base.pseudonymize = true;
        let retrieval = base.retrieval_for("1.2.3".into(), "1.2.3.4".into());
        assert_eq!(retrieval.level, QueryLevel::Series);
        assert_eq!(retrieval.study_instance_uid.as_deref(), Some("1.2.3"));
        assert_eq!(retrieval.series_instance_uid.as_deref(), Some("1.2.3.4"));
        assert!(retrieval.pseudonymize);
        assert!(retrieval.patient_id.is_none());
    }
}
