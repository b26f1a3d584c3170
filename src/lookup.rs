// 🔎 Lookup Resolver - metadata snapshot → read-only lookup tables
//
// Built once per run from the organisation_units / data_elements snapshot and
// shared by reference across worker threads. Lookups are data: nothing here
// knows a specific facility, county, or data element.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{IdentifierKind, PipelineError, RecordError};
use crate::records::{Method, OrgLevel};

// ============================================================================
// METADATA SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub id: String,
    pub name: String,
    pub level: OrgLevel,
    pub parent_id: Option<String>,
}

impl OrgUnit {
    pub fn new(id: &str, name: &str, level: OrgLevel, parent_id: Option<&str>) -> Self {
        OrgUnit {
            id: id.to_string(),
            name: name.to_string(),
            level,
            parent_id: parent_id.map(String::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataElement {
    pub id: String,
    pub name: String,
}

impl DataElement {
    pub fn new(id: &str, name: &str) -> Self {
        DataElement {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

/// Metadata as refreshed by the extractor, independent of pipeline runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub org_units: Vec<OrgUnit>,
    pub data_elements: Vec<DataElement>,
}

// ============================================================================
// ANALYTIC MAPPING
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticEntry {
    pub analytic: String,
    pub element_name: String,
    /// None when the element name carries no method marker
    pub method: Option<Method>,
}

// ============================================================================
// LOOKUP TABLES
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    org_units: HashMap<String, OrgUnit>,
    analytics: HashMap<String, AnalyticEntry>,
}

impl LookupTables {
    /// Build the tables from a snapshot.
    ///
    /// Only data elements listed in `analytic_ids` are mapped; the method is
    /// derived from the element name by `classify`.
    pub fn build<F>(
        snapshot: &MetadataSnapshot,
        analytic_ids: &BTreeMap<String, String>,
        classify: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<Method>,
    {
        let org_units = snapshot
            .org_units
            .iter()
            .map(|ou| (ou.id.clone(), ou.clone()))
            .collect();

        let analytics = snapshot
            .data_elements
            .iter()
            .filter_map(|de| {
                analytic_ids.get(&de.id).map(|analytic| {
                    (
                        de.id.clone(),
                        AnalyticEntry {
                            analytic: analytic.clone(),
                            element_name: de.name.clone(),
                            method: classify(&de.name),
                        },
                    )
                })
            })
            .collect();

        LookupTables { org_units, analytics }
    }

    /// Fatal when either table is empty: every record would be dropped.
    pub fn ensure_populated(&self) -> Result<(), PipelineError> {
        if self.org_units.is_empty() {
            return Err(PipelineError::LookupTableEmpty("organisation_units".to_string()));
        }
        if self.analytics.is_empty() {
            return Err(PipelineError::LookupTableEmpty("data_elements".to_string()));
        }
        Ok(())
    }

    /// True when some County carries exactly this display name.
    pub fn has_county_named(&self, name: &str) -> bool {
        self.org_units
            .values()
            .any(|ou| ou.level == OrgLevel::County && ou.name == name)
    }

    pub fn org_unit_count(&self) -> usize {
        self.org_units.len()
    }

    pub fn analytic_count(&self) -> usize {
        self.analytics.len()
    }

    /// Human-readable name for any identifier.
    pub fn resolve_name(&self, kind: IdentifierKind, id: &str) -> Result<&str, RecordError> {
        match kind {
            IdentifierKind::OrgUnit => self.resolve_org_unit(id).map(|ou| ou.name.as_str()),
            IdentifierKind::DataElement => self
                .analytics
                .get(id)
                .map(|entry| entry.analytic.as_str())
                .ok_or_else(|| RecordError::unresolved(kind, id)),
        }
    }

    pub fn resolve_org_unit(&self, id: &str) -> Result<&OrgUnit, RecordError> {
        self.org_units
            .get(id)
            .ok_or_else(|| RecordError::unresolved(IdentifierKind::OrgUnit, id))
    }

    /// The org unit followed by its ancestors, ending at the root.
    ///
    /// Levels must strictly decrease on the way up; a missing parent, a cycle
    /// or a level inversion makes the chain unresolved.
    pub fn ancestors(&self, id: &str) -> Result<Vec<&OrgUnit>, RecordError> {
        let mut node = self.resolve_org_unit(id)?;
        let mut chain = vec![node];

        while let Some(parent_id) = node.parent_id.as_deref() {
            let parent = self
                .org_units
                .get(parent_id)
                .ok_or_else(|| RecordError::unresolved(IdentifierKind::OrgUnit, parent_id))?;

            if parent.level >= node.level {
                return Err(RecordError::unresolved(IdentifierKind::OrgUnit, id));
            }

            chain.push(parent);
            node = parent;
        }

        Ok(chain)
    }

    /// The County an org unit rolls up to (itself when it is a County).
    pub fn county_of(&self, id: &str) -> Result<&OrgUnit, RecordError> {
        self.ancestors(id)?
            .into_iter()
            .find(|ou| ou.level == OrgLevel::County)
            .ok_or_else(|| RecordError::NoCountyAncestor { id: id.to_string() })
    }

    /// (analytic, method) for a data element id.
    pub fn resolve_analytic(&self, id: &str) -> Result<(&str, Method), RecordError> {
        let entry = self
            .analytics
            .get(id)
            .ok_or_else(|| RecordError::unresolved(IdentifierKind::DataElement, id))?;

        let method = entry
            .method
            .ok_or_else(|| RecordError::UnresolvedMethod { id: id.to_string() })?;

        Ok((entry.analytic.as_str(), method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetadataSnapshot {
        MetadataSnapshot {
            org_units: vec![
                OrgUnit::new("KE", "Kenya", OrgLevel::Country, None),
                OrgUnit::new("NRB", "Nairobi County", OrgLevel::County, Some("KE")),
                OrgUnit::new("SC", "Westlands", OrgLevel::SubCounty, Some("NRB")),
                OrgUnit::new("WD", "Parklands", OrgLevel::Ward, Some("SC")),
                OrgUnit::new("F1", "Parklands Clinic", OrgLevel::Facility, Some("WD")),
                OrgUnit::new("ORPHAN", "Orphan Clinic", OrgLevel::Facility, Some("MISSING")),
                OrgUnit::new("LOOP_A", "Loop A", OrgLevel::Ward, Some("LOOP_B")),
                OrgUnit::new("LOOP_B", "Loop B", OrgLevel::Ward, Some("LOOP_A")),
            ],
            data_elements: vec![
                DataElement::new("E1", "MOH 711 Implants"),
                DataElement::new("E2", "Population estimate"),
                DataElement::new("E3", "Not in the analytic table"),
            ],
        }
    }

    fn analytic_ids() -> BTreeMap<String, String> {
        [("E1", "Implanon"), ("E2", "Unknown Marker")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn tables() -> LookupTables {
        LookupTables::build(&snapshot(), &analytic_ids(), |name| {
            name.contains("711").then_some(Method::Service)
        })
    }

    #[test]
    fn test_ancestor_chain() {
        let tables = tables();
        let chain: Vec<&str> = tables
            .ancestors("F1")
            .unwrap()
            .iter()
            .map(|ou| ou.id.as_str())
            .collect();
        assert_eq!(chain, vec!["F1", "WD", "SC", "NRB", "KE"]);
    }

    #[test]
    fn test_county_of() {
        let tables = tables();
        assert_eq!(tables.county_of("F1").unwrap().name, "Nairobi County");
        assert_eq!(tables.county_of("NRB").unwrap().name, "Nairobi County");
        assert!(matches!(
            tables.county_of("KE"),
            Err(RecordError::NoCountyAncestor { .. })
        ));
    }

    #[test]
    fn test_broken_hierarchies_are_unresolved() {
        let tables = tables();
        assert!(matches!(
            tables.county_of("ORPHAN"),
            Err(RecordError::UnresolvedIdentifier { kind: IdentifierKind::OrgUnit, .. })
        ));
        // Same-level parent loop terminates instead of spinning
        assert!(tables.ancestors("LOOP_A").is_err());
        assert!(tables.county_of("NOWHERE").is_err());
    }

    #[test]
    fn test_resolve_analytic() {
        let tables = tables();
        assert_eq!(tables.resolve_analytic("E1").unwrap(), ("Implanon", Method::Service));
        assert!(matches!(
            tables.resolve_analytic("E2"),
            Err(RecordError::UnresolvedMethod { .. })
        ));
        assert!(matches!(
            tables.resolve_analytic("E3"),
            Err(RecordError::UnresolvedIdentifier { kind: IdentifierKind::DataElement, .. })
        ));
    }

    #[test]
    fn test_resolve_name() {
        let tables = tables();
        assert_eq!(tables.resolve_name(IdentifierKind::OrgUnit, "WD").unwrap(), "Parklands");
        assert_eq!(tables.resolve_name(IdentifierKind::DataElement, "E1").unwrap(), "Implanon");
        assert!(tables.resolve_name(IdentifierKind::DataElement, "E3").is_err());
    }

    #[test]
    fn test_empty_tables_are_fatal() {
        let empty = LookupTables::build(&MetadataSnapshot::default(), &analytic_ids(), |_| None);
        assert!(matches!(
            empty.ensure_populated(),
            Err(PipelineError::LookupTableEmpty(_))
        ));
        assert!(tables().ensure_populated().is_ok());
    }

    #[test]
    fn test_has_county_named() {
        let tables = tables();
        assert!(tables.has_county_named("Nairobi County"));
        // Only County-level units count
        assert!(!tables.has_county_named("Kenya"));
        assert!(!tables.has_county_named("Parklands"));
    }
}
