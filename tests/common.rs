#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};
use flash_settings::error::{Error, FlashError};
use flash_settings::handler::{ExportTarget, Handler};
use flash_settings::value;
use std::cell::{Cell, RefCell};

pub const FLASH_SECTOR_SIZE: usize = 4096;
pub const WORD_SIZE: usize = 4;

/// Flash recording every operation, failing all operations after `fail_after_operation`.
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    /// Fail every operation after the next `operations` ones.
    pub fn fail_after(&mut self, operations: usize) {
        self.fail_after_operation = self.operations.len() + operations;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn check_fault(&self) -> Result<(), FlashError> {
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError::Device);
        }
        Ok(())
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        self.check_fault()?;
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        self.check_fault()?;
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE as _));
        assert!(!bytes.is_empty());

        self.check_fault()?;
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl flash_settings::platform::Crc for Flash {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(init as _, data.as_ptr(), data.len() as u32) as u32 }
    }
}

/// Key of `name=value` entries.
pub fn key_of(entry: &[u8]) -> Option<&[u8]> {
    entry
        .iter()
        .position(|&b| b == b'=')
        .map(|pos| &entry[..pos])
}

/// `myfoo/mybar` (u8) and `myfoo/mybar64` (u64), recording which callbacks ran.
#[derive(Default)]
pub struct MyFoo {
    pub val8: Cell<u8>,
    pub val64: Cell<u64>,
    pub get_called: Cell<bool>,
    pub set_called: Cell<bool>,
    pub commit_called: Cell<bool>,
    pub export_block: Cell<bool>,
    pub last_args: RefCell<Vec<String>>,
}

impl MyFoo {
    pub fn clear_call_state(&self) {
        self.get_called.set(false);
        self.set_called.set(false);
        self.commit_called.set(false);
    }

    pub fn call_state(&self) -> usize {
        self.get_called.get() as usize
            + self.set_called.get() as usize
            + self.commit_called.get() as usize
    }
}

impl Handler for MyFoo {
    fn name(&self) -> &str {
        "myfoo"
    }

    fn get(&self, args: &[&str]) -> Result<String, Error> {
        self.get_called.set(true);
        match args {
            ["mybar"] => Ok(value::to_value(&self.val8.get())),
            ["mybar64"] => Ok(value::to_value(&self.val64.get())),
            _ => Err(Error::UnknownKey),
        }
    }

    fn set(&self, args: &[&str], v: Option<&str>) -> Result<(), Error> {
        self.set_called.set(true);
        *self.last_args.borrow_mut() = args.iter().map(|a| a.to_string()).collect();
        match args {
            ["mybar"] => self.val8.set(value::parse(v)?),
            ["mybar64"] => self.val64.set(value::parse(v)?),
            _ => return Err(Error::UnknownKey),
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), Error> {
        self.commit_called.set(true);
        Ok(())
    }

    fn export(
        &self,
        emit: &mut dyn FnMut(&str, Option<&str>),
        _target: ExportTarget,
    ) -> Result<(), Error> {
        if self.export_block.get() {
            return Ok(());
        }
        emit("myfoo/mybar", Some(&value::to_value(&self.val8.get())));
        emit("myfoo/mybar64", Some(&value::to_value(&self.val64.get())));
        Ok(())
    }
}

pub const STRING_COUNT: usize = 64;

/// `2nd/string0` .. `2nd/string{count - 1}`.
pub struct Strings {
    pub values: RefCell<Vec<String>>,
    pub count: Cell<usize>,
}

impl Strings {
    pub fn new(count: usize) -> Self {
        Self {
            values: RefCell::new(vec![String::new(); STRING_COUNT]),
            count: Cell::new(count),
        }
    }

    fn index(&self, arg: &str) -> Result<usize, Error> {
        arg.strip_prefix("string")
            .and_then(|i| i.parse::<usize>().ok())
            .filter(|&i| i < self.count.get())
            .ok_or(Error::UnknownKey)
    }

    /// Deterministic 255 character values, different for every slot and iteration.
    pub fn fill(&self, iteration: usize) {
        let mut values = self.values.borrow_mut();
        for (j, value) in values.iter_mut().enumerate() {
            *value = (0..255)
                .map(|i| char::from(b'0' + ((j * 2 + i + iteration) % 10) as u8))
                .collect();
        }
    }

    pub fn clear(&self) {
        for value in self.values.borrow_mut().iter_mut() {
            value.clear();
        }
    }
}

impl Handler for Strings {
    fn name(&self) -> &str {
        "2nd"
    }

    fn get(&self, args: &[&str]) -> Result<String, Error> {
        match args {
            [arg] => Ok(self.values.borrow()[self.index(arg)?].clone()),
            _ => Err(Error::UnknownKey),
        }
    }

    fn set(&self, args: &[&str], v: Option<&str>) -> Result<(), Error> {
        match args {
            [arg] => {
                let index = self.index(arg)?;
                self.values.borrow_mut()[index] = v.unwrap_or_default().to_string();
                Ok(())
            }
            _ => Err(Error::UnknownKey),
        }
    }

    fn export(
        &self,
        emit: &mut dyn FnMut(&str, Option<&str>),
        _target: ExportTarget,
    ) -> Result<(), Error> {
        let values = self.values.borrow();
        for (i, value) in values.iter().take(self.count.get()).enumerate() {
            emit(&format!("2nd/string{i}"), Some(value));
        }
        Ok(())
    }
}

/// `3/v` (u32), without commit.
#[derive(Default)]
pub struct Three {
    pub val32: Cell<u32>,
}

impl Handler for Three {
    fn name(&self) -> &str {
        "3"
    }

    fn get(&self, args: &[&str]) -> Result<String, Error> {
        match args {
            ["v"] => Ok(value::to_value(&self.val32.get())),
            _ => Err(Error::UnknownKey),
        }
    }

    fn set(&self, args: &[&str], v: Option<&str>) -> Result<(), Error> {
        match args {
            ["v"] => {
                self.val32.set(value::parse(v)?);
                Ok(())
            }
            _ => Err(Error::UnknownKey),
        }
    }

    fn export(
        &self,
        emit: &mut dyn FnMut(&str, Option<&str>),
        _target: ExportTarget,
    ) -> Result<(), Error> {
        emit("3/v", Some(&value::to_value(&self.val32.get())));
        Ok(())
    }
}
