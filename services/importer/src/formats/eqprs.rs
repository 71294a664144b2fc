//! EQPRS performance indicator reports
//!
//! Closed header, no repeated columns. An indicator is identified by its
//! department and its name, so the parent key is only known once the
//! department has been reconciled.

use serde::Serialize;
use uuid::Uuid;

use super::{EntityRefs, Fields, RowError, SnapshotFormat};
use crate::header::{HeaderLayout, HeaderSpec};
use crate::reconcile::slugify;
use crate::rows::RawRow;
use crate::scope::Sphere;
use crate::store::ImportKind;

pub const EQPRS_HEADERS: &[&str] = &[
    "Government",
    "Department",
    "Programme",
    "Sub-Programme",
    "Indicator",
    "Frequency",
    "Type",
    "Sub-Type",
    "Sector",
    "MTSF Outcome",
    "Cluster",
    "Q1 Target",
    "Q1 Actual Output",
    "Q1 Deviation Reason",
    "Q1 Corrective Action",
    "Q2 Target",
    "Q2 Actual Output",
    "Q2 Deviation Reason",
    "Q2 Corrective Action",
    "Q3 Target",
    "Q3 Actual Output",
    "Q3 Deviation Reason",
    "Q3 Corrective Action",
    "Q4 Target",
    "Q4 Actual Output",
    "Q4 Deviation Reason",
    "Q4 Corrective Action",
    "Annual Target",
    "Annual Aggregate Output",
    "Annual Pre-audit Output",
    "Annual Deviation Reason",
    "Annual Corrective Action",
    "Annual Audited Output",
];

pub const EQPRS_SPEC: HeaderSpec = HeaderSpec::new(EQPRS_HEADERS, None);

const QUARTER_COLUMNS: [[&str; 4]; 4] = [
    ["Q1 Target", "Q1 Actual Output", "Q1 Deviation Reason", "Q1 Corrective Action"],
    ["Q2 Target", "Q2 Actual Output", "Q2 Deviation Reason", "Q2 Corrective Action"],
    ["Q3 Target", "Q3 Actual Output", "Q3 Deviation Reason", "Q3 Corrective Action"],
    ["Q4 Target", "Q4 Actual Output", "Q4 Deviation Reason", "Q4 Corrective Action"],
];

/// Target and reported output for one quarter. Values stay text: targets
/// are often written as percentages or ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuarterOutput {
    pub target: Option<String>,
    pub actual_output: Option<String>,
    pub deviation_reason: Option<String>,
    pub corrective_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndicatorRow {
    pub government: Option<String>,
    pub department: String,
    pub programme: Option<String>,
    pub sub_programme: Option<String>,
    pub indicator: String,
    pub frequency: Option<String>,
    #[serde(rename = "type")]
    pub indicator_type: Option<String>,
    pub sub_type: Option<String>,
    pub sector: Option<String>,
    pub mtsf_outcome: Option<String>,
    pub cluster: Option<String>,
    pub quarters: [QuarterOutput; 4],
    pub annual_target: Option<String>,
    pub annual_aggregate_output: Option<String>,
    pub annual_pre_audit_output: Option<String>,
    pub annual_deviation_reason: Option<String>,
    pub annual_corrective_action: Option<String>,
    pub annual_audited_output: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EqprsFormat;

impl SnapshotFormat for EqprsFormat {
    type Row = IndicatorRow;

    fn kind(&self) -> ImportKind {
        ImportKind::Indicators
    }

    fn header_spec(&self) -> &HeaderSpec {
        &EQPRS_SPEC
    }

    fn parse_row(&self, raw: &RawRow, _layout: &HeaderLayout) -> Result<IndicatorRow, RowError> {
        let f = Fields::new(raw, &EQPRS_SPEC);
        let quarters = QUARTER_COLUMNS.map(|[target, actual, reason, action]| QuarterOutput {
            target: f.text(target),
            actual_output: f.text(actual),
            deviation_reason: f.text(reason),
            corrective_action: f.text(action),
        });

        Ok(IndicatorRow {
            government: f.text("Government"),
            department: f.required("Department")?,
            programme: f.text("Programme"),
            sub_programme: f.text("Sub-Programme"),
            indicator: f.required("Indicator")?,
            frequency: f.text("Frequency"),
            indicator_type: f.text("Type"),
            sub_type: f.text("Sub-Type"),
            sector: f.text("Sector"),
            mtsf_outcome: f.text("MTSF Outcome"),
            cluster: f.text("Cluster"),
            quarters,
            annual_target: f.text("Annual Target"),
            annual_aggregate_output: f.text("Annual Aggregate Output"),
            annual_pre_audit_output: f.text("Annual Pre-audit Output"),
            annual_deviation_reason: f.text("Annual Deviation Reason"),
            annual_corrective_action: f.text("Annual Corrective Action"),
            annual_audited_output: f.text("Annual Audited Output"),
        })
    }

    fn entity_refs(
        &self,
        row: &IndicatorRow,
        sphere: Sphere,
        national_government: &str,
    ) -> Result<EntityRefs, RowError> {
        // National reports name the sphere ("National") rather than a government
        let government = match sphere {
            Sphere::National => national_government.to_string(),
            Sphere::Provincial => row
                .government
                .clone()
                .ok_or(RowError::Missing { column: "Government" })?,
        };
        Ok(EntityRefs {
            government,
            department: row.department.clone(),
            category: row.sector.clone(),
        })
    }

    fn parent_key(&self, row: &IndicatorRow, department_id: Uuid) -> String {
        format!("{}:{}", department_id, slugify(&row.indicator))
    }

    fn display_name(&self, row: &IndicatorRow) -> String {
        row.indicator.clone()
    }
}
