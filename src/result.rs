use crate::driver::DriverType;
use crate::session::AnalyzerChannel;
use polars::prelude::*;

/// A completed capture. Bit `i` of every sample word is the level of `channels[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub source: DriverType,
    pub samples: Vec<u128>,
    pub channels: Vec<AnalyzerChannel>,
    pub trigger_channel: u8,
    pub pre_samples: u32,
    pub frequency: u32,
    pub loop_count: u8,
}

const TIME_COLUMN_NAME: &str = "time";

impl CaptureResult {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Levels of one channel, one byte (0 or 1) per sample.
    pub fn channel_samples(&self, bit: usize) -> Option<Vec<u8>> {
        if bit >= self.channels.len() {
            return None;
        }
        Some(
            self.samples
                .iter()
                .map(|sample| ((sample >> bit) & 1) as u8)
                .collect(),
        )
    }

    /// Time of a sample index in seconds, zero at the trigger.
    pub fn sample_time(&self, index: usize) -> f64 {
        (index as f64 - f64::from(self.pre_samples)) / f64::from(self.frequency.max(1))
    }

    /// Columnar view: a `time` column followed by one boolean column per channel,
    /// named after the channel label.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("to_dataframe"), 0));

        let times: Vec<f64> = (0..self.samples.len())
            .map(|index| self.sample_time(index))
            .collect();

        let mut columns: Vec<Column> = Vec::with_capacity(self.channels.len() + 1);
        columns.push(Series::new(TIME_COLUMN_NAME.into(), times).into());

        for (bit, channel) in self.channels.iter().enumerate() {
            let levels: Vec<bool> = self
                .samples
                .iter()
                .map(|sample| (sample >> bit) & 1 == 1)
                .collect();
            columns.push(Series::new(channel.label().into(), levels).into());
        }

        DataFrame::new(columns)
    }
}
