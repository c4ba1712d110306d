// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Global runtime options. Everything lives under this top-level section.
mod global_config {
    pub const SECTION_NAME: &str = "spindle";
}

// Coroutine pool options.
mod coro_pool_config {
    pub const SECTION_NAME: &str = "coro_pool";
    pub const MAX_SIZE: &str = "max_size";
}

// Per-processor options. The section is a list, one entry per task processor.
mod task_processor_config {
    pub const SECTION_NAME: &str = "task_processors";
    pub const NAME: &str = "name";
    pub const WORKER_THREADS: &str = "worker_threads";
    pub const QUEUE_LENGTH_LIMIT: &str = "queue_length_limit";
    pub const QUEUE_WAIT_LIMIT_US: &str = "queue_wait_limit_us";
}

/// Default number of worker threads for a processor that does not configure one.
const DEFAULT_WORKER_THREADS: usize = 2;

/// Default number of coroutine slots shared by all processors of a runtime.
const DEFAULT_CORO_POOL_MAX_SIZE: usize = 512;

/// Name of the processor that exists when no processor section is configured.
pub const DEFAULT_PROCESSOR_NAME: &str = "main";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration, backed by a parsed YAML document.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Sizing of the coroutine pool shared by all task processors of a runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoroPoolSettings {
    /// Upper bound on concurrently-live coroutines. Spawns beyond this fail with EAGAIN.
    pub max_size: usize,
}

/// Settings for one task processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Processor name, used for lookup and carried in log lines.
    pub name: String,
    /// Number of worker threads servicing the run queue.
    pub worker_threads: usize,
    /// Overload control: once the run queue holds this many tasks, newly enqueued normal-importance
    /// tasks are cancelled instead of admitted. Unset disables the check.
    pub queue_length_limit: Option<usize>,
    /// Overload control: a dequeued normal-importance task that waited in the queue longer than this
    /// is cancelled instead of run. Unset disables the check.
    pub queue_wait_limit: Option<Duration>,
}

/// Fully-resolved settings for a runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub coro_pool: CoroPoolSettings,
    pub processors: Vec<ProcessorSettings>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Common associate functions for runtime configuration objects.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn from_file(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_str(&config_s)
    }

    /// Parses a configuration document into a [Config] object.
    pub fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("failed to parse configuration: {:?}", e);
                error!("from_str(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    /// Resolves the whole document into [RuntimeSettings], filling in defaults for absent sections.
    pub fn runtime_settings(&self) -> Result<RuntimeSettings, Fail> {
        let global: &Yaml = match Self::try_get_option(&self.0, global_config::SECTION_NAME) {
            Some(global) => global,
            None => return Ok(RuntimeSettings::default()),
        };

        let coro_pool: CoroPoolSettings = self.coro_pool_settings(global)?;
        let processors: Vec<ProcessorSettings> = self.processor_settings(global)?;

        Ok(RuntimeSettings { coro_pool, processors })
    }

    /// Resolves the coroutine pool section, if present.
    fn coro_pool_settings(&self, global: &Yaml) -> Result<CoroPoolSettings, Fail> {
        let section: &Yaml = match Self::try_get_option(global, coro_pool_config::SECTION_NAME) {
            Some(section) => section,
            None => return Ok(CoroPoolSettings::default()),
        };
        let max_size: usize = Self::get_int_option(section, coro_pool_config::MAX_SIZE)?;
        if max_size == 0 {
            let cause: String = format!("parameter \"{}\" may not be zero", coro_pool_config::MAX_SIZE);
            error!("coro_pool_settings(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        Ok(CoroPoolSettings { max_size })
    }

    /// Resolves the task processor list, if present.
    fn processor_settings(&self, global: &Yaml) -> Result<Vec<ProcessorSettings>, Fail> {
        let section: &Yaml = match Self::try_get_option(global, task_processor_config::SECTION_NAME) {
            Some(section) => section,
            None => return Ok(vec![ProcessorSettings::default()]),
        };
        let entries: &Vec<Yaml> = match section.as_vec() {
            Some(entries) => entries,
            None => {
                let cause: String =
                    format!("parameter \"{}\" has unexpected type", task_processor_config::SECTION_NAME);
                error!("processor_settings(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if entries.is_empty() {
            let cause: String = format!("parameter \"{}\" may not be empty", task_processor_config::SECTION_NAME);
            error!("processor_settings(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let mut processors: Vec<ProcessorSettings> = Vec::with_capacity(entries.len());
        for entry in entries {
            let settings: ProcessorSettings = Self::one_processor(entry)?;
            if processors.iter().any(|p| p.name == settings.name) {
                let cause: String = format!("duplicate task processor name \"{}\"", settings.name);
                error!("processor_settings(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            processors.push(settings);
        }

        Ok(processors)
    }

    /// Resolves one entry of the task processor list.
    fn one_processor(entry: &Yaml) -> Result<ProcessorSettings, Fail> {
        let name: String =
            Self::get_typed_str_option(entry, task_processor_config::NAME, |val: &str| Some(val.to_string()))?;

        let worker_threads: usize = match Self::try_get_option(entry, task_processor_config::WORKER_THREADS) {
            Some(_) => Self::get_int_option(entry, task_processor_config::WORKER_THREADS)?,
            None => DEFAULT_WORKER_THREADS,
        };
        if worker_threads == 0 {
            let cause: String = format!("parameter \"{}\" may not be zero", task_processor_config::WORKER_THREADS);
            error!("one_processor(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let queue_length_limit: Option<usize> =
            match Self::try_get_option(entry, task_processor_config::QUEUE_LENGTH_LIMIT) {
                Some(_) => Some(Self::get_int_option(entry, task_processor_config::QUEUE_LENGTH_LIMIT)?),
                None => None,
            };

        let queue_wait_limit: Option<Duration> =
            match Self::try_get_option(entry, task_processor_config::QUEUE_WAIT_LIMIT_US) {
                Some(_) => {
                    let micros: u64 = Self::get_int_option(entry, task_processor_config::QUEUE_WAIT_LIMIT_US)?;
                    Some(Duration::from_micros(micros))
                },
                None => None,
            };

        Ok(ProcessorSettings {
            name,
            worker_threads,
            queue_length_limit,
            queue_wait_limit,
        })
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Index `yaml` to find the value at `index`, tolerating its absence.
    fn try_get_option<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml.index(index) {
            Yaml::BadValue => None,
            value => Some(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find value at `index`, validating it as a string.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let message: String = format!("parameter \"{}\" has unexpected type", index);
        Err(Fail::new(libc::EINVAL, message.as_str()))
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Coroutine Pool Settings
impl Default for CoroPoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CORO_POOL_MAX_SIZE,
        }
    }
}

/// Default Trait Implementation for Processor Settings
impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROCESSOR_NAME.to_string(),
            worker_threads: DEFAULT_WORKER_THREADS,
            queue_length_limit: None,
            queue_wait_limit: None,
        }
    }
}

/// Default Trait Implementation for Runtime Settings
impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            coro_pool: CoroPoolSettings::default(),
            processors: vec![ProcessorSettings::default()],
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
