//! Driver configuration, loaded from YAML.
use chip8::{prelude::*, Hz};
use serde::Deserialize;

use crate::error::AppError;

/// Settings for a single run of the driver.
///
/// ```yaml
/// vm:
///   clock_frequency: 500
///   rng_seed: 42
/// steps: 2000
/// inputs:
///   - { step: 100, key: 5, pressed: true }
///   - { step: 110, key: 5, pressed: false }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConf {
    pub vm: Chip8Conf,
    /// Stop after this many steps. `None` runs until the program stalls or fails.
    pub steps: Option<usize>,
    /// Scripted key events, standing in for a keyboard.
    pub inputs: Vec<InputDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDef {
    /// Step number before which the key state is applied.
    pub step: usize,
    pub key: u8,
    pub pressed: bool,
}

/// Key event ready to be fed into the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub step: usize,
    pub key: KeyCode,
    pub pressed: bool,
}

impl CliConf {
    pub fn from_file(filepath: &str) -> Result<Self, AppError> {
        let file = std::fs::File::open(filepath)?;
        let conf: CliConf = serde_yaml::from_reader(file)?;
        log::debug!("loaded config: {conf:#?}");
        Ok(conf)
    }

    pub fn parse(source: &str) -> Result<Self, AppError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Validated key events, in step order.
    pub fn input_events(&self) -> Result<Vec<InputEvent>, AppError> {
        let mut events = self
            .inputs
            .iter()
            .map(|def| -> Result<InputEvent, AppError> {
                Ok(InputEvent {
                    step: def.step,
                    key: KeyCode::try_from(def.key)?,
                    pressed: def.pressed,
                })
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        // Stable, so events on the same step keep their order.
        events.sort_by_key(|ev| ev.step);

        Ok(events)
    }

    pub fn clock_frequency(&self) -> Option<Hz> {
        self.vm.clock_frequency.filter(|hz| hz.0 > 0)
    }
}
