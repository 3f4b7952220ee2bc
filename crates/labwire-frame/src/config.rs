use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Default transport read size: 8 KiB.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default bound on one write or shutdown of the transport.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for reading and writing framed streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameConfig {
    /// How long a partial line may sit unterminated before the connection
    /// treats the device as wedged. `None` disables the watchdog.
    #[serde(rename = "read_timeout_ms", with = "millis::option")]
    pub read_timeout: Option<Duration>,
    /// Upper bound on a single write to the transport.
    ///
    /// Connections stop reading while a write is pending, so two peers that
    /// both fill their socket buffers only recover through this limit.
    /// `None` waits forever.
    #[serde(rename = "write_timeout_ms", with = "millis::option")]
    pub write_timeout: Option<Duration>,
    /// Bytes requested from the transport per read.
    pub read_chunk_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl FrameConfig {
    /// Drive `write` to completion within `write_timeout`.
    ///
    /// Expiry is reported as an [`io::ErrorKind::TimedOut`] frame error.
    pub async fn bounded_write<F, E>(&self, write: F) -> Result<(), E>
    where
        F: Future<Output = Result<(), E>>,
        E: From<FrameError>,
    {
        let Some(limit) = self.write_timeout else {
            return write.await;
        };
        match tokio::time::timeout(limit, write).await {
            Ok(done) => done,
            Err(_) => Err(E::from(FrameError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {limit:?}"),
            )))),
        }
    }
}

/// Serde helpers for durations expressed as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
