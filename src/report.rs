use std::{
    fs::{create_dir_all, File},
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
#[allow(unused_imports)]
use log::debug;
use tempfile::NamedTempFile;

use crate::test::ResultSet;

pub const OUTPUT_FILENAME: &str = "output";
pub const RESULTS_FILENAME: &str = "results";

// Aggregate artifacts of a whole run: the console output of every test,
// appended in the order they ran, and the final results as JSON. With no
// output directory everything is discarded.
pub struct ReportWriter {
    dir: Option<Output>,
}

struct Output {
    path: PathBuf,
    output: BufWriter<File>,
}

impl ReportWriter {
    pub fn create(dir: Option<&Path>) -> anyhow::Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self { dir: None });
        };
        debug!("Writing run output to {}", dir.display());
        create_dir_all(dir).with_context(|| format!("creating output dir {}", dir.display()))?;
        let output_path = dir.join(OUTPUT_FILENAME);
        let output = File::create(&output_path)
            .with_context(|| format!("creating {}", output_path.display()))?;
        Ok(Self {
            dir: Some(Output {
                path: dir.to_owned(),
                output: BufWriter::new(output),
            }),
        })
    }

    pub fn append_output(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let Some(out) = &mut self.dir else {
            return Ok(());
        };
        out.output
            .write_all(data)
            .context("appending to output file")
    }

    // Flush the output log and write the results. The results file is replaced
    // atomically so readers never see a partial one.
    pub fn finish(self, results: &ResultSet) -> anyhow::Result<()> {
        let Some(mut out) = self.dir else {
            return Ok(());
        };
        out.output.flush().context("flushing output file")?;

        let mut tmp = NamedTempFile::new_in(&out.path)
            .with_context(|| format!("creating temp file in {}", out.path.display()))?;
        serde_json::to_writer(&mut tmp, results).context("serializing results")?;
        let results_path = out.path.join(RESULTS_FILENAME);
        tmp.persist(&results_path)
            .with_context(|| format!("writing {}", results_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::test::{Status, TestName, TestResult};

    #[test]
    fn test_writes_output_and_results() {
        let dir = TempDir::new().unwrap();
        let out_dir = dir.path().join("out");
        let mut writer = ReportWriter::create(Some(&out_dir)).unwrap();
        // The output file exists before anything is written to it.
        assert!(out_dir.join(OUTPUT_FILENAME).exists());
        writer.append_output(b"first\n").unwrap();
        writer.append_output(b"second\n").unwrap();

        let a = TestName::from("a");
        let mut results = ResultSet::pending([&a]);
        results.set(&a, TestResult::new(Status::Failed));
        writer.finish(&results).unwrap();

        assert_eq!(
            fs::read_to_string(out_dir.join(OUTPUT_FILENAME)).unwrap(),
            "first\nsecond\n"
        );
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(out_dir.join(RESULTS_FILENAME)).unwrap()).unwrap();
        assert_eq!(json["a"]["Status"], 3);
    }

    #[test]
    fn test_no_output_dir() {
        let mut writer = ReportWriter::create(None).unwrap();
        writer.append_output(b"dropped").unwrap();
        writer.finish(&ResultSet::default()).unwrap();
    }
}
