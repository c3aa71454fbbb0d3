use std::collections::BTreeMap;

use serde::Serialize;

use super::canonical::{CanonicalRecord, Feature};

/// Default breakpoints per feature, shared by the population histograms and
/// by any piecewise rule that does not override them.
pub fn default_breaks(feature: Feature) -> &'static [f64] {
    match feature {
        Feature::MeterAgeYears => &[5.0, 10.0, 15.0],
        Feature::AnomalyRate => &[0.03, 0.07, 0.12],
        Feature::ConsumptionCv => &[0.10, 0.25, 0.40],
        Feature::InconsistenciasRate => &[0.10, 0.30, 0.50],
        Feature::DelinquencyDays => &[30.0, 90.0, 180.0],
        Feature::OpenInvoicesCount => &[1.0, 3.0, 6.0],
        Feature::OpenAmountRatio => &[0.10, 0.30, 0.60],
    }
}

/// Locates the half-open bin containing `value`.
///
/// N breakpoints define N+1 bins `(-inf,b1], (b1,b2], …, (bN,+inf)`; the
/// returned index is the only binning rule in the crate, shared between the
/// population aggregator and the piecewise evaluator.
pub fn bin_index(value: f64, breaks: &[f64]) -> usize {
    for (idx, boundary) in breaks.iter().enumerate() {
        if value <= *boundary {
            return idx;
        }
    }
    breaks.len()
}

/// One histogram bucket. `None` bounds stand for the unbounded ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureBin {
    pub range: (Option<f64>, Option<f64>),
    pub count: u64,
}

/// The N+1 empty buckets implied by a breakpoint sequence.
pub fn build_ranges(breaks: &[f64]) -> Vec<FeatureBin> {
    let mut bins = Vec::with_capacity(breaks.len() + 1);
    let mut lower = None;
    for boundary in breaks {
        bins.push(FeatureBin {
            range: (lower, Some(*boundary)),
            count: 0,
        });
        lower = Some(*boundary);
    }
    bins.push(FeatureBin {
        range: (lower, None),
        count: 0,
    });
    bins
}

/// Bins a column of optional values. Empty input and all-`None` columns
/// produce all-zero counts, never an error.
pub fn histogram(values: &[Option<f64>], breaks: &[f64]) -> Vec<FeatureBin> {
    let mut bins = build_ranges(breaks);
    for value in values.iter().flatten().filter(|v| v.is_finite()) {
        bins[bin_index(*value, breaks)].count += 1;
    }
    bins
}

/// Per-feature histograms plus presence rates over one population, the
/// shape handed to the external calibration service.
#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub population: usize,
    pub features: BTreeMap<&'static str, Vec<FeatureBin>>,
    pub presence: BTreeMap<&'static str, f64>,
}

impl PopulationSummary {
    pub fn summarize(records: &[CanonicalRecord]) -> Self {
        let population = records.len();
        let mut features = BTreeMap::new();
        let mut presence = BTreeMap::new();

        for feature in Feature::ALL {
            let column: Vec<Option<f64>> =
                records.iter().map(|r| r.feature(feature)).collect();
            let present = column.iter().filter(|v| v.is_some()).count();
            let rate = if population == 0 {
                0.0
            } else {
                present as f64 / population as f64
            };
            features.insert(feature.name(), histogram(&column, default_breaks(feature)));
            presence.insert(feature.name(), rate);
        }

        Self {
            population,
            features,
            presence,
        }
    }
}
