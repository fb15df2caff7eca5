//! GUM-style uncertainty budgets.
//!
//! Components are combined by root-sum-of-squares without covariance terms and
//! expanded with a fixed coverage factor k = 2. Effective degrees of freedom
//! (Welch-Satterthwaite) are not evaluated.

use serde::{Deserialize, Serialize};

use crate::calibration::model::{Channel, ChannelId};
use crate::calibration::statistics::ChannelStatistics;
use crate::config::{Distribution, UncertaintyConfig};

pub const COVERAGE_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    TypeA,
    TypeB,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyComponent {
    pub name: String,
    pub value: f64,
    pub distribution: Distribution,
    pub standard_uncertainty: f64,
    pub kind: ComponentKind,
    /// Share of u_c², percent.
    pub contribution_pct: f64,
}

impl UncertaintyComponent {
    pub fn new(name: &str, value: f64, distribution: Distribution, kind: ComponentKind) -> Self {
        Self {
            name: name.to_string(),
            value,
            distribution,
            standard_uncertainty: standard_uncertainty(value, distribution),
            kind,
            contribution_pct: 0.0,
        }
    }
}

pub fn standard_uncertainty(value: f64, distribution: Distribution) -> f64 {
    match distribution {
        Distribution::Normal => value,
        Distribution::Rectangular => value / 3f64.sqrt(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyBudget {
    pub channel: ChannelId,
    pub point_index: usize,
    pub components: Vec<UncertaintyComponent>,
    pub combined_standard_uncertainty: f64,
    pub coverage_factor: f64,
    pub expanded_uncertainty: f64,
}

impl UncertaintyBudget {
    pub fn combine(channel: ChannelId, point_index: usize, mut components: Vec<UncertaintyComponent>) -> Self {
        let variance: f64 = components.iter().map(|c| c.standard_uncertainty.powi(2)).sum();
        for component in &mut components {
            component.contribution_pct = if variance > 0.0 {
                100.0 * component.standard_uncertainty.powi(2) / variance
            } else {
                0.0
            };
        }
        let combined = variance.sqrt();

        Self {
            channel,
            point_index,
            components,
            combined_standard_uncertainty: combined,
            coverage_factor: COVERAGE_FACTOR,
            expanded_uncertainty: COVERAGE_FACTOR * combined,
        }
    }

    pub fn component(&self, name: &str) -> Option<&UncertaintyComponent> {
        self.components.iter().find(|c| c.name == name)
    }
}

pub struct UncertaintyEngine {
    config: UncertaintyConfig,
}

impl UncertaintyEngine {
    pub fn new(config: UncertaintyConfig) -> Self {
        Self { config }
    }

    /// Budget for `channel` at one point. Sensor channels carry the reference
    /// channel's repeatability as a second Type-A term. Thermocouples scale
    /// each Type-B term by its `thermocouple_factor` and add a cold junction
    /// term.
    pub fn budget(
        &self,
        channel: &Channel,
        own: &ChannelStatistics,
        reference: Option<&ChannelStatistics>,
    ) -> UncertaintyBudget {
        let mut components = vec![UncertaintyComponent::new(
            &format!("repeatability {}", own.channel),
            own.std_uncertainty,
            Distribution::Normal,
            ComponentKind::TypeA,
        )];
        if let Some(reference) = reference.filter(|r| r.channel != own.channel) {
            components.push(UncertaintyComponent::new(
                &format!("repeatability {}", reference.channel),
                reference.std_uncertainty,
                Distribution::Normal,
                ComponentKind::TypeA,
            ));
        }

        components.extend(self.config.type_b.iter().map(|b| {
            UncertaintyComponent::new(&b.name, b.value_for(channel.sensor), b.distribution, ComponentKind::TypeB)
        }));
        if channel.sensor.is_thermocouple() {
            components.push(UncertaintyComponent::new(
                "cold junction",
                self.config.thermocouple_cold_junction_c,
                Distribution::Rectangular,
                ComponentKind::TypeB,
            ));
        }

        UncertaintyBudget::combine(own.channel.clone(), own.point_index, components)
    }
}
