use crate::error::Error;
use crate::line::{make_line, parse_line};
use crate::store::Store;
use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Stores settings as `name=value` lines in a text file.
///
/// The file only ever grows by appending. Once it reaches `max_lines` lines it is rewritten
/// keeping the last line of every name.
pub struct FileStore {
    path: PathBuf,
    max_lines: usize,
    lines: Cell<usize>,
}

impl FileStore {
    /// `max_lines == 0` disables compression.
    pub fn new(path: impl Into<PathBuf>, max_lines: usize) -> Self {
        Self {
            path: path.into(),
            max_lines,
            lines: Cell::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of valid lines seen by the last load, compression or save.
    pub fn lines(&self) -> usize {
        self.lines.get()
    }

    fn read(&self) -> Result<String, Error> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".cmp");
        tmp.into()
    }

    /// Rewrites the file keeping only the last line of every name.
    pub fn compress(&self) -> Result<(), Error> {
        let content = self.read()?;
        let records: Vec<(&str, Option<&str>)> =
            content.lines().filter_map(|l| parse_line(l).ok()).collect();

        let tmp = self.tmp_path();
        let mut out = String::new();
        let mut kept = 0;
        for (i, (name, value)) in records.iter().enumerate() {
            if records[i + 1..].iter().any(|(later, _)| later == name) {
                continue;
            }
            out.push_str(&make_line(name, *value)?);
            out.push('\n');
            kept += 1;
        }
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &self.path)?;

        #[cfg(feature = "debug-logs")]
        println!(
            "FileStore: compressed {} lines into {kept}",
            records.len()
        );

        self.lines.set(kept);
        Ok(())
    }
}

impl Store for FileStore {
    fn load(&self, visit: &mut dyn FnMut(&str, Option<&str>)) -> Result<(), Error> {
        let content = self.read()?;
        let mut lines = 0;
        for line in content.lines() {
            match parse_line(line) {
                Ok((name, value)) => {
                    lines += 1;
                    visit(name, value);
                }
                Err(_e) => {
                    #[cfg(feature = "debug-logs")]
                    println!("FileStore: skipping line {line:?}: {_e}");
                }
            }
        }
        self.lines.set(lines);
        Ok(())
    }

    fn save(&self, name: &str, value: Option<&str>) -> Result<(), Error> {
        let mut record = make_line(name, value)?;
        record.push('\n');

        if self.max_lines > 0 && self.lines.get() + 1 >= self.max_lines {
            self.compress()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record.as_bytes())?;
        self.lines.set(self.lines.get() + 1);
        Ok(())
    }
}
