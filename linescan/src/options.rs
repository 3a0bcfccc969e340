// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::time::Duration;

/// Runtime knobs for a scan session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// The largest data request sent to the device, in bytes.
    pub block_size: usize,

    /// How many times an exchange is attempted before a retryable error is returned.
    pub retries: u8,

    /// Timeout for command exchanges.
    pub command_timeout: Duration,

    /// Timeout for data transfers, which can take much longer than commands.
    pub data_timeout: Duration,

    /// Milliseconds to wait between status polls.
    pub poll_interval_ms: u32,

    /// Polls before a busy motor or a stalled strip transfer is treated as a timeout.
    pub max_polls: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            block_size: 0x1_0000,
            retries: 3,
            command_timeout: Duration::from_secs(5),
            data_timeout: Duration::from_secs(30),
            poll_interval_ms: 10,
            max_polls: 500,
        }
    }
}

impl SessionOptions {
    pub fn with_block_size(self, block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            ..self
        }
    }

    pub fn with_retries(self, retries: u8) -> Self {
        Self { retries, ..self }
    }

    pub fn with_command_timeout(self, command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            ..self
        }
    }

    pub fn with_data_timeout(self, data_timeout: Duration) -> Self {
        Self {
            data_timeout,
            ..self
        }
    }

    pub fn with_polling(self, poll_interval_ms: u32, max_polls: u32) -> Self {
        Self {
            poll_interval_ms,
            max_polls,
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::SessionOptions;

    #[test]
    fn builders() {
        let options = SessionOptions::default()
            .with_block_size(0)
            .with_retries(7)
            .with_polling(1, 2);
        // A zero block size would never make progress.
        assert_eq!(options.block_size, 1);
        assert_eq!(options.retries, 7);
        assert_eq!(options.poll_interval_ms, 1);
        assert_eq!(options.max_polls, 2);
        assert_eq!(
            options.command_timeout,
            SessionOptions::default().command_timeout
        );
    }
}
