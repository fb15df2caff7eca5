pub mod settings;

pub use settings::{
    ComponentConfig,
    Config,
    Distribution,
    FurnaceConfig,
    FurnaceRegisters,
    ParityConfig,
    PointConfig,
    SamplingConfig,
    StabilityConfig,
    ThermometerConfig,
    UncertaintyConfig,
};
