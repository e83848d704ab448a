//! Persistent id counter of the XML database
//!
//! Stored in `idgen.xml` as `<xmlroot><counter>N</counter></xmlroot>`.

use crate::core::{Error, Result};
use crate::storage::fs::FileOps;
use crate::storage::xml::transaction::replace_file;
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug)]
struct Counter {
    value: u64,
    dirty: bool,
}

/// Monotonic id source with a dirty flag
#[derive(Debug)]
pub struct XmlIdGenerator {
    counter: Mutex<Counter>,
}

impl XmlIdGenerator {
    /// Generator whose next id is `start + 1`
    pub fn new(start: u64) -> Self {
        Self {
            counter: Mutex::new(Counter {
                value: start,
                dirty: true,
            }),
        }
    }

    /// Next id. Marks the generator dirty.
    pub fn new_id(&self) -> String {
        let mut counter = self.counter.lock();
        counter.value += 1;
        counter.dirty = true;
        counter.value.to_string()
    }

    /// Last id handed out
    pub fn value(&self) -> u64 {
        self.counter.lock().value
    }

    /// Raise the counter to at least `floor`
    pub fn ensure_at_least(&self, floor: u64) {
        let mut counter = self.counter.lock();
        if counter.value < floor {
            counter.value = floor;
            counter.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.counter.lock().dirty
    }

    /// Serialized form
    pub fn to_xml(&self) -> String {
        render(self.value())
    }

    /// Parse a saved generator; it starts out clean
    pub fn from_xml(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut in_counter = false;
        let mut value = None;
        loop {
            match reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"counter" => in_counter = true,
                Event::End(e) if e.name().as_ref() == b"counter" => in_counter = false,
                Event::Text(t) if in_counter => {
                    let text = t.unescape()?;
                    let parsed = text.trim().parse::<u64>().map_err(|_| {
                        Error::invalid_input(format!("Invalid id counter {:?}", text.trim()))
                    })?;
                    value = Some(parsed);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        let value = value.ok_or_else(|| Error::invalid_input("Id generator has no counter"))?;
        Ok(Self {
            counter: Mutex::new(Counter {
                value,
                dirty: false,
            }),
        })
    }

    /// Read the generator stored at `path`
    pub fn load(ops: &dyn FileOps, path: &Path) -> Result<Self> {
        let text = ops.read_to_string(path)?;
        Self::from_xml(&text)
    }

    /// Write the generator to `path` if dirty. The file is replaced through
    /// a temp file; the dirty flag is cleared only once that succeeded.
    /// Returns whether anything was written.
    pub fn save(&self, ops: &dyn FileOps, path: &Path) -> Result<bool> {
        // Holding the lock keeps ids handed out during the write dirty.
        let mut counter = self.counter.lock();
        if !counter.dirty {
            return Ok(false);
        }
        let dir = path
            .parent()
            .ok_or_else(|| Error::internal(format!("No directory for {}", path.display())))?;
        let temp = ops.write_temp(dir, "idgen.", render(counter.value).as_bytes())?;
        if let Err(e) = replace_file(ops, &temp, path) {
            if let Err(cleanup) = ops.remove_file(&temp) {
                warn!(temp = %temp.display(), error = %cleanup, "Could not remove id generator temp file");
            }
            return Err(Error::persistence("saveIdGenerator", e.into()));
        }
        counter.dirty = false;
        debug!(counter = counter.value, "Saved id generator");
        Ok(true)
    }
}

fn render(value: u64) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<xmlroot>\n  <counter>{}</counter>\n</xmlroot>\n",
        value
    )
}
