// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::Once;

static INIT_LOG: Once = Once::new();

/// Initializes the logging facility once per process. Verbosity comes from RUST_LOG when set.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let handle: LoggerHandle = Logger::try_with_env_or_str("info").unwrap().start().unwrap();
        // The handle flushes and shuts the logger down on drop, so it has to live as long as the process.
        ::std::mem::forget(handle);
    });
}
