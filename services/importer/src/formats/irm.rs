//! Infrastructure Reporting Model (IRM) project snapshots
//!
//! One row per project per reporting period. 36 fixed columns followed by any
//! number of "Project Contractor" columns holding role-prefixed party names.

use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use super::{EntityRefs, Fields, RowError, SnapshotFormat};
use crate::collapse::{collapse_repeated, IRM_PARTIES};
use crate::header::{HeaderLayout, HeaderSpec};
use crate::rows::RawRow;
use crate::scope::Sphere;
use crate::store::ImportKind;

pub const IRM_HEADERS: &[&str] = &[
    "Project ID",
    "Project Name",
    "Department",
    "Sector",
    "Province",
    "Local Municipality",
    "District Municipality",
    "Latitude",
    "Longitude",
    "Project Status",
    "Budget Programme",
    "Primary Funding Source",
    "Nature of Investment",
    "Funding Status",
    "Project Start Date",
    "Estimated Construction Start Date",
    "Estimated Project Completion Date",
    "Contracted Construction End Date",
    "Estimated Construction End Date",
    "Total Professional Fees",
    "Total Construction Costs",
    "Variation Orders",
    "Estimated Total Project Cost",
    "Expenditure from Previous Years Professional Fees",
    "Expenditure from Previous Years Construction Costs",
    "Project Expenditure Total",
    "Main Appropriation Professional Fees",
    "Adjustment Appropriation Professional Fees",
    "Main Appropriation Construction Costs",
    "Adjustment Appropriation Construction Costs",
    "Main Appropriation Total",
    "Adjustment Appropriation Total",
    "Actual Expenditure Q1",
    "Actual Expenditure Q2",
    "Actual Expenditure Q3",
    "Actual Expenditure Q4",
];

pub const CONTRACTOR_MARKER: &str = "Project Contractor";

pub const IRM_SPEC: HeaderSpec = HeaderSpec::new(IRM_HEADERS, Some(CONTRACTOR_MARKER));

/// One IRM project row, typed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrmRow {
    pub project_id: String,
    pub project_name: String,
    pub department: String,
    pub sector: Option<String>,
    pub province: Option<String>,
    pub local_municipality: Option<String>,
    pub district_municipality: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: Option<String>,
    pub budget_programme: Option<String>,
    pub primary_funding_source: Option<String>,
    pub nature_of_investment: Option<String>,
    pub funding_status: Option<String>,
    pub project_start_date: Option<NaiveDate>,
    pub estimated_construction_start_date: Option<NaiveDate>,
    pub estimated_completion_date: Option<NaiveDate>,
    pub contracted_construction_end_date: Option<NaiveDate>,
    pub estimated_construction_end_date: Option<NaiveDate>,
    pub total_professional_fees: Option<f64>,
    pub total_construction_costs: Option<f64>,
    pub variation_orders: Option<f64>,
    pub estimated_total_project_cost: Option<f64>,
    pub expenditure_from_previous_years_professional_fees: Option<f64>,
    pub expenditure_from_previous_years_construction_costs: Option<f64>,
    pub project_expenditure_total: Option<f64>,
    pub main_appropriation_professional_fees: Option<f64>,
    pub adjustment_appropriation_professional_fees: Option<f64>,
    pub main_appropriation_construction_costs: Option<f64>,
    pub adjustment_appropriation_construction_costs: Option<f64>,
    pub main_appropriation_total: Option<f64>,
    pub adjustment_appropriation_total: Option<f64>,
    pub actual_expenditure_q1: Option<f64>,
    pub actual_expenditure_q2: Option<f64>,
    pub actual_expenditure_q3: Option<f64>,
    pub actual_expenditure_q4: Option<f64>,
    pub program_implementing_agent: String,
    pub principal_agent: String,
    pub main_contractor: String,
    pub other_parties: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IrmFormat;

impl SnapshotFormat for IrmFormat {
    type Row = IrmRow;

    fn kind(&self) -> ImportKind {
        ImportKind::IrmSnapshot
    }

    fn header_spec(&self) -> &HeaderSpec {
        &IRM_SPEC
    }

    fn parse_row(&self, raw: &RawRow, layout: &HeaderLayout) -> Result<IrmRow, RowError> {
        let f = Fields::new(raw, &IRM_SPEC);
        let parties = collapse_repeated(raw, &layout.repeated, &IRM_PARTIES);

        Ok(IrmRow {
            project_id: f.required("Project ID")?,
            project_name: f.text("Project Name").unwrap_or_default(),
            department: f.required("Department")?,
            sector: f.text("Sector"),
            province: f.text("Province"),
            local_municipality: f.text("Local Municipality"),
            district_municipality: f.text("District Municipality"),
            latitude: f.number("Latitude")?,
            longitude: f.number("Longitude")?,
            status: f.text("Project Status"),
            budget_programme: f.text("Budget Programme"),
            primary_funding_source: f.text("Primary Funding Source"),
            nature_of_investment: f.text("Nature of Investment"),
            funding_status: f.text("Funding Status"),
            project_start_date: f.date("Project Start Date")?,
            estimated_construction_start_date: f.date("Estimated Construction Start Date")?,
            estimated_completion_date: f.date("Estimated Project Completion Date")?,
            contracted_construction_end_date: f.date("Contracted Construction End Date")?,
            estimated_construction_end_date: f.date("Estimated Construction End Date")?,
            total_professional_fees: f.number("Total Professional Fees")?,
            total_construction_costs: f.number("Total Construction Costs")?,
            variation_orders: f.number("Variation Orders")?,
            estimated_total_project_cost: f.number("Estimated Total Project Cost")?,
            expenditure_from_previous_years_professional_fees: f
                .number("Expenditure from Previous Years Professional Fees")?,
            expenditure_from_previous_years_construction_costs: f
                .number("Expenditure from Previous Years Construction Costs")?,
            project_expenditure_total: f.number("Project Expenditure Total")?,
            main_appropriation_professional_fees: f.number("Main Appropriation Professional Fees")?,
            adjustment_appropriation_professional_fees: f
                .number("Adjustment Appropriation Professional Fees")?,
            main_appropriation_construction_costs: f.number("Main Appropriation Construction Costs")?,
            adjustment_appropriation_construction_costs: f
                .number("Adjustment Appropriation Construction Costs")?,
            main_appropriation_total: f.number("Main Appropriation Total")?,
            adjustment_appropriation_total: f.number("Adjustment Appropriation Total")?,
            actual_expenditure_q1: f.number("Actual Expenditure Q1")?,
            actual_expenditure_q2: f.number("Actual Expenditure Q2")?,
            actual_expenditure_q3: f.number("Actual Expenditure Q3")?,
            actual_expenditure_q4: f.number("Actual Expenditure Q4")?,
            program_implementing_agent: parties.joined("Program Implementing Agent"),
            principal_agent: parties.joined("Principal Agent"),
            main_contractor: parties.joined("Main Contractor"),
            other_parties: parties.joined("Other parties"),
        })
    }

    fn entity_refs(
        &self,
        row: &IrmRow,
        sphere: Sphere,
        national_government: &str,
    ) -> Result<EntityRefs, RowError> {
        let government = match sphere {
            Sphere::National => national_government.to_string(),
            Sphere::Provincial => row
                .province
                .clone()
                .ok_or(RowError::Missing { column: "Province" })?,
        };
        Ok(EntityRefs {
            government,
            department: row.department.clone(),
            category: row.sector.clone(),
        })
    }

    fn parent_key(&self, row: &IrmRow, _department_id: Uuid) -> String {
        row.project_id.clone()
    }

    fn display_name(&self, row: &IrmRow) -> String {
        if row.project_name.is_empty() {
            row.project_id.clone()
        } else {
            row.project_name.clone()
        }
    }
}
