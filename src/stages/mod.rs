//! Built-in correction stages.
//!
//! | type name           | stage                     |
//! |---------------------|---------------------------|
//! | `geometry`          | [`GeometryStage`]         |
//! | `fringe_rotation`   | [`FringeRotationStage`]   |
//! | `hardware_delay`    | [`HardwareDelayStage`]    |
//! | `calibration`       | [`CalibrationStage`]      |
//! | `channel_averaging` | [`ChannelAveragingStage`] |
pub mod averaging;
pub mod calibration;
pub mod fringe;
pub mod gain_table;
pub mod geometry;
pub mod hw_delay;

pub use averaging::ChannelAveragingStage;
pub use calibration::CalibrationStage;
pub use fringe::{DelayReference, FringeMode, FringeRotationStage};
pub use gain_table::{GainTable, Receptor};
pub use geometry::{DelayCalculator, GeometryStage};
pub use hw_delay::{
    ChannelDelayControl, DelayCommand, DelayControl, HardwareDelayStage, LoggingDelayControl,
};
