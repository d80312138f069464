use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Append-only metric log with an explicit lifecycle, injected into the
/// trainer rather than reached through a global.
///
/// One line per event, space-separated fields:
///   `TEST <epoch> <timestamp> <accuracy>`
///   `TRAIN <epoch> <batch_idx> <timestamp> <loss>`
/// TEST and TRAIN lines interleave; consumers must not assume fixed counts
/// per epoch. Lines are never rewritten once flushed.
pub struct TrainLogger {
    out: BufWriter<File>,
    path: PathBuf,
}

impl TrainLogger {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("cannot open log file {path:?}"))?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn timestamp() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn log_test(&mut self, epoch: usize, accuracy: f32) -> Result<()> {
        writeln!(self.out, "TEST {} {} {}", epoch, Self::timestamp(), accuracy)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn log_train(&mut self, epoch: usize, batch_idx: usize, loss: f32) -> Result<()> {
        writeln!(
            self.out,
            "TRAIN {} {} {} {}",
            epoch,
            batch_idx,
            Self::timestamp(),
            loss
        )?;
        self.out.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_have_the_documented_shape() -> Result<()> {
        let path =
            std::env::temp_dir().join(format!("centaur-log-{}.txt", std::process::id()));
        let mut logger = TrainLogger::create(&path)?;
        logger.log_test(0, 0.5)?;
        logger.log_train(0, 3, 1.25)?;
        logger.close()?;

        let text = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let test_fields: Vec<&str> = lines[0].split(' ').collect();
        assert_eq!(test_fields[0], "TEST");
        assert_eq!(test_fields[1], "0");
        assert_eq!(test_fields.len(), 4);

        let train_fields: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(train_fields[0], "TRAIN");
        assert_eq!(train_fields[1], "0");
        assert_eq!(train_fields[2], "3");
        assert_eq!(train_fields.len(), 5);
        Ok(())
    }
}
