pub mod model;
pub mod stability;
pub mod statistics;
pub mod uncertainty;
pub mod classification;
pub mod events;
pub mod sampler;
pub mod session;
pub mod engine;

pub use classification::{ChannelClassification, ClassificationEngine, ClassificationResult};
pub use engine::{CalibrationEngine, SessionHandle};
pub use events::{ControlSignal, EngineEvent, EngineState, StatusSnapshot};
pub use model::{AccuracyClass, CalibrationPoint, Channel, ChannelId, MeasurementSet, Reading, SensorType};
pub use sampler::MeasurementSampler;
pub use session::{CalibrationSession, ChannelSummary, FaultRecord, PointRecord};
pub use stability::{StabilityCriteria, StabilityDetector};
pub use statistics::{ChannelStatistics, LinearFit, StatisticsEngine};
pub use uncertainty::{UncertaintyBudget, UncertaintyComponent, UncertaintyEngine};
