// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory register map of a device.
//!
//! A [`Store`] holds the four register classes. Each entry covers one or
//! more consecutive addresses and may carry callbacks that run when the
//! entry is read or written from the wire.
//!
//! Callbacks are invoked without any internal lock held, so they may call
//! back into the store, e.g. to reset it with [`Store::bulk_setup`]. They
//! must not call [`Store::dispatch`].

use std::{
    collections::BTreeMap,
    fmt,
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::ConfigError,
    frame::{Address, Coil, ExceptionCode, Quantity, Request, Response, Word},
};

mod definition;

pub use self::definition::{DefaultValue, Definition, Definitions};

/// Placeholder of coils and discrete inputs if defaults are requested.
const PLACEHOLDER_BIT: Coil = true;

/// Placeholder of holding and input registers if defaults are requested.
const PLACEHOLDER_WORD: Word = 999;

/// The four _Modbus_ data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterClass {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterClass {
    pub const ALL: [Self; 4] = [
        Self::Coil,
        Self::DiscreteInput,
        Self::HoldingRegister,
        Self::InputRegister,
    ];

    /// Coils and discrete inputs hold single bits.
    #[must_use]
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    /// Only coils and holding registers can be written from the wire.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    const fn index(self) -> usize {
        match self {
            Self::Coil => 0,
            Self::DiscreteInput => 1,
            Self::HoldingRegister => 2,
            Self::InputRegister => 3,
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Coil => "coil",
            Self::DiscreteInput => "discrete input",
            Self::HoldingRegister => "holding register",
            Self::InputRegister => "input register",
        };
        f.write_str(name)
    }
}

/// Values of consecutive registers of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Values {
    Bits(Vec<Coil>),
    Words(Vec<Word>),
}

impl Values {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bits(bits) => bits.len(),
            Self::Words(words) => words.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-zero words are converted to `true`.
    #[must_use]
    pub fn into_bits(self) -> Vec<Coil> {
        match self {
            Self::Bits(bits) => bits,
            Self::Words(words) => words.into_iter().map(|word| word != 0).collect(),
        }
    }

    #[must_use]
    pub fn into_words(self) -> Vec<Word> {
        match self {
            Self::Bits(bits) => bits.into_iter().map(Word::from).collect(),
            Self::Words(words) => words,
        }
    }

    fn empty_of(class: RegisterClass) -> Self {
        if class.is_bit() {
            Self::Bits(Vec::new())
        } else {
            Self::Words(Vec::new())
        }
    }

    fn matches(&self, class: RegisterClass) -> bool {
        matches!(self, Self::Bits(_)) == class.is_bit()
    }

    fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Self::Bits(bits) => Self::Bits(bits[range].to_vec()),
            Self::Words(words) => Self::Words(words[range].to_vec()),
        }
    }

    fn copy_from(&mut self, offset: usize, other: &Self) {
        match (self, other) {
            (Self::Bits(dst), Self::Bits(src)) => {
                dst[offset..offset + src.len()].copy_from_slice(src);
            }
            (Self::Words(dst), Self::Words(src)) => {
                dst[offset..offset + src.len()].copy_from_slice(src);
            }
            // Rejected by the callers.
            _ => debug_assert!(false, "mismatching register values"),
        }
    }

    fn append(&mut self, other: Self) {
        match (self, other) {
            (Self::Bits(dst), Self::Bits(mut src)) => dst.append(&mut src),
            (Self::Words(dst), Self::Words(mut src)) => dst.append(&mut src),
            _ => debug_assert!(false, "mismatching register values"),
        }
    }
}

impl From<Vec<Coil>> for Values {
    fn from(from: Vec<Coil>) -> Self {
        Self::Bits(from)
    }
}

impl From<Vec<Word>> for Values {
    fn from(from: Vec<Word>) -> Self {
        Self::Words(from)
    }
}

impl From<Coil> for Values {
    fn from(from: Coil) -> Self {
        Self::Bits(vec![from])
    }
}

impl From<Word> for Values {
    fn from(from: Word) -> Self {
        Self::Words(vec![from])
    }
}

/// Called with the values that have been read. A returned value replaces
/// them in the response and must have the same length.
pub type GetCallback = Arc<dyn Fn(RegisterClass, Address, &Values) -> Option<Values> + Send + Sync>;

/// Called with the values that have been written.
pub type SetCallback = Arc<dyn Fn(RegisterClass, Address, &Values) + Send + Sync>;

/// Called with the values about to be written. Returning `true` vetoes
/// the write.
pub type PreSetCallback = Arc<dyn Fn(RegisterClass, Address, &Values) -> bool + Send + Sync>;

#[derive(Clone)]
struct Entry {
    values: Values,
    on_get: Option<GetCallback>,
    on_set: Option<SetCallback>,
    on_pre_set: Option<PreSetCallback>,
}

impl Entry {
    fn new(values: Values) -> Self {
        Self {
            values,
            on_get: None,
            on_set: None,
            on_pre_set: None,
        }
    }

    fn end(&self, base: Address) -> u32 {
        u32::from(base) + u32::try_from(self.values.len()).unwrap_or(u32::MAX)
    }
}

/// The part of a requested range that falls into one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    base: Address,
    offset: usize,
    len: usize,
    /// Offset into the requested range.
    position: usize,
}

impl Segment {
    #[allow(clippy::cast_possible_truncation)]
    fn address(&self) -> Address {
        // Entries never exceed the address space.
        (usize::from(self.base) + self.offset) as Address
    }

    fn entry_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    fn request_range(&self) -> Range<usize> {
        self.position..self.position + self.len
    }
}

type Entries = BTreeMap<Address, Entry>;

#[derive(Default)]
struct Table {
    classes: [Entries; 4],
    changed: BTreeMap<(RegisterClass, Address), Values>,
}

impl Table {
    fn entries(&self, class: RegisterClass) -> &Entries {
        &self.classes[class.index()]
    }

    fn entries_mut(&mut self, class: RegisterClass) -> &mut Entries {
        &mut self.classes[class.index()]
    }

    /// Splits `address..address + count` along the entries that cover it.
    fn resolve(
        &self,
        class: RegisterClass,
        address: Address,
        count: usize,
    ) -> Result<Vec<Segment>, ExceptionCode> {
        let entries = self.entries(class);
        let end = u32::from(address) + u32::try_from(count).unwrap_or(u32::MAX);
        let mut segments = Vec::new();
        let mut next = u32::from(address);
        while next < end {
            let current = Address::try_from(next).map_err(|_| ExceptionCode::IllegalDataAddress)?;
            let Some((base, entry)) = entries.range(..=current).next_back() else {
                return Err(ExceptionCode::IllegalDataAddress);
            };
            let entry_end = entry.end(*base);
            if next >= entry_end {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let segment_end = end.min(entry_end);
            let len = (segment_end - next) as usize;
            segments.push(Segment {
                base: *base,
                offset: (next - u32::from(*base)) as usize,
                len,
                position: (next - u32::from(address)) as usize,
            });
            next = segment_end;
        }
        Ok(segments)
    }

    fn read(&self, class: RegisterClass, segments: &[Segment]) -> Values {
        let entries = self.entries(class);
        let mut values = Values::empty_of(class);
        for segment in segments {
            if let Some(entry) = entries.get(&segment.base) {
                values.append(entry.values.slice(segment.entry_range()));
            }
        }
        values
    }

    fn write(&mut self, class: RegisterClass, segments: &[Segment], values: &Values) {
        let entries = self.entries_mut(class);
        for segment in segments {
            if let Some(entry) = entries.get_mut(&segment.base) {
                entry
                    .values
                    .copy_from(segment.offset, &values.slice(segment.request_range()));
            }
        }
    }

    fn insert(
        &mut self,
        class: RegisterClass,
        name: &str,
        address: Address,
        entry: Entry,
    ) -> Result<(), ConfigError> {
        if entry.values.is_empty() {
            return Err(ConfigError::EmptyRegister {
                class,
                name: name.to_owned(),
            });
        }
        if entry.end(address) > 0x1_0000 {
            return Err(ConfigError::AddressOverflow {
                class,
                name: name.to_owned(),
            });
        }
        let entries = self.entries(class);
        let overlaps_previous = entries
            .range(..=address)
            .next_back()
            .is_some_and(|(base, previous)| previous.end(*base) > u32::from(address));
        let overlaps_next = entries
            .range(address..)
            .next()
            .is_some_and(|(base, _)| u32::from(*base) < entry.end(address));
        if overlaps_previous || overlaps_next {
            return Err(ConfigError::OverlappingRegisters {
                class,
                name: name.to_owned(),
                address,
            });
        }
        self.entries_mut(class).insert(address, entry);
        Ok(())
    }

    fn build(definitions: &Definitions, use_defaults: bool) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for class in RegisterClass::ALL {
            for (name, definition) in definitions.class(class) {
                let len = usize::from(definition.len);
                let values = match &definition.default {
                    Some(default) if !use_defaults => default.to_values(class, name, len)?,
                    _ if class.is_bit() => Values::Bits(vec![PLACEHOLDER_BIT; len]),
                    _ => Values::Words(vec![PLACEHOLDER_WORD; len]),
                };
                let entry = Entry {
                    values,
                    on_get: definition.on_get.clone(),
                    on_set: definition.on_set.clone(),
                    on_pre_set: definition.on_pre_set.clone(),
                };
                table.insert(class, name, definition.address, entry)?;
            }
        }
        Ok(table)
    }
}

#[derive(Default)]
struct Inner {
    table: Mutex<Table>,
    dispatch: Mutex<()>,
}

/// Shared handle to the registers of one device.
///
/// Cloning the handle shares the registers, e.g. between an RTU and a TCP
/// device.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Inner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// An empty store. Every request is answered with an illegal data
    /// address until registers are declared.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from definitions.
    pub fn with_definitions(
        definitions: &Definitions,
        use_defaults: bool,
    ) -> Result<Self, ConfigError> {
        let store = Self::new();
        store.bulk_setup(definitions, use_defaults)?;
        Ok(store)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A panicking callback never runs under this lock.
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces all registers.
    ///
    /// With `use_defaults` every register starts with the placeholder
    /// `true` or `999` instead of its defined default value. Nothing is
    /// changed if the definitions are invalid.
    pub fn bulk_setup(
        &self,
        definitions: &Definitions,
        use_defaults: bool,
    ) -> Result<(), ConfigError> {
        let table = Table::build(definitions, use_defaults)?;
        log::debug!(
            "Register setup with {} coils, {} discrete inputs, {} holding registers, {} input registers",
            table.entries(RegisterClass::Coil).len(),
            table.entries(RegisterClass::DiscreteInput).len(),
            table.entries(RegisterClass::HoldingRegister).len(),
            table.entries(RegisterClass::InputRegister).len(),
        );
        *self.table() = table;
        Ok(())
    }

    /// Declares one more entry without callbacks.
    pub fn add(
        &self,
        class: RegisterClass,
        address: Address,
        values: impl Into<Values>,
    ) -> Result<(), ConfigError> {
        let values = values.into();
        let values = if values.matches(class) {
            values
        } else if class.is_bit() {
            Values::Bits(values.into_bits())
        } else {
            Values::Words(values.into_words())
        };
        self.table()
            .insert(class, &address.to_string(), address, Entry::new(values))
    }

    /// Reads registers from the wire side, running `on_get` callbacks.
    pub fn get(
        &self,
        class: RegisterClass,
        address: Address,
        count: Quantity,
    ) -> Result<Values, ExceptionCode> {
        let parts = {
            let table = self.table();
            let segments = table.resolve(class, address, count.into())?;
            let entries = table.entries(class);
            segments
                .iter()
                .filter_map(|segment| {
                    let entry = entries.get(&segment.base)?;
                    Some((
                        segment.address(),
                        entry.values.slice(segment.entry_range()),
                        entry.on_get.clone(),
                    ))
                })
                .collect::<Vec<_>>()
        };
        let mut result = Values::empty_of(class);
        for (address, values, on_get) in parts {
            let values = match on_get.and_then(|on_get| on_get(class, address, &values)) {
                Some(replaced) if replaced.len() == values.len() && replaced.matches(class) => {
                    replaced
                }
                Some(replaced) => {
                    log::warn!(
                        "Discarding {} values returned for {class} {address}, expected {}",
                        replaced.len(),
                        values.len()
                    );
                    return Err(ExceptionCode::ServerDeviceFailure);
                }
                None => values,
            };
            result.append(values);
        }
        Ok(result)
    }

    /// Writes registers from the wire side.
    ///
    /// All `on_pre_set` callbacks of the touched entries run first; a
    /// single veto rejects the whole write. `on_set` callbacks run after
    /// the values have been stored.
    pub fn set(
        &self,
        class: RegisterClass,
        address: Address,
        values: &Values,
    ) -> Result<(), ExceptionCode> {
        if !values.matches(class) {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let parts = {
            let table = self.table();
            let segments = table.resolve(class, address, values.len())?;
            let entries = table.entries(class);
            segments
                .iter()
                .filter_map(|segment| {
                    let entry = entries.get(&segment.base)?;
                    Some((
                        segment.address(),
                        values.slice(segment.request_range()),
                        entry.on_pre_set.clone(),
                        entry.on_set.clone(),
                    ))
                })
                .collect::<Vec<_>>()
        };

        for (address, values, on_pre_set, _) in &parts {
            if on_pre_set
                .as_ref()
                .is_some_and(|on_pre_set| on_pre_set(class, *address, values))
            {
                log::debug!("Write of {class} {address} rejected: {values:?}");
                return Err(ExceptionCode::IllegalDataValue);
            }
        }

        {
            let mut table = self.table();
            // The table might have been replaced by a callback.
            let segments = table.resolve(class, address, values.len())?;
            table.write(class, &segments, values);
            for (address, values, _, _) in &parts {
                table.changed.insert((class, *address), values.clone());
            }
        }

        for (address, values, _, on_set) in parts {
            if let Some(on_set) = on_set {
                on_set(class, address, &values);
            }
        }
        Ok(())
    }

    /// Executes a request from the wire.
    ///
    /// Dispatches on the same store are serialized, including all
    /// callbacks they trigger.
    pub fn dispatch(&self, request: &Request<'_>) -> Result<Response, ExceptionCode> {
        use RegisterClass::*;

        let _dispatch = self
            .inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        log::debug!("Dispatching {request:?}");
        let response = match request {
            Request::ReadCoils(address, quantity) => {
                Response::ReadCoils(self.get(Coil, *address, *quantity)?.into_bits())
            }
            Request::ReadDiscreteInputs(address, quantity) => Response::ReadDiscreteInputs(
                self.get(DiscreteInput, *address, *quantity)?.into_bits(),
            ),
            Request::ReadHoldingRegisters(address, quantity) => Response::ReadHoldingRegisters(
                self.get(HoldingRegister, *address, *quantity)?.into_words(),
            ),
            Request::ReadInputRegisters(address, quantity) => Response::ReadInputRegisters(
                self.get(InputRegister, *address, *quantity)?.into_words(),
            ),
            Request::WriteSingleCoil(address, coil) => {
                self.set(Coil, *address, &Values::from(*coil))?;
                Response::WriteSingleCoil(*address, *coil)
            }
            Request::WriteMultipleCoils(address, coils) => {
                self.set(Coil, *address, &Values::Bits(coils.to_vec()))?;
                Response::WriteMultipleCoils(*address, quantity_of(coils.len())?)
            }
            Request::WriteSingleRegister(address, word) => {
                self.set(HoldingRegister, *address, &Values::from(*word))?;
                Response::WriteSingleRegister(*address, *word)
            }
            Request::WriteMultipleRegisters(address, words) => {
                self.set(HoldingRegister, *address, &Values::Words(words.to_vec()))?;
                Response::WriteMultipleRegisters(*address, quantity_of(words.len())?)
            }
        };
        Ok(response)
    }

    fn read_local(
        &self,
        class: RegisterClass,
        address: Address,
        count: usize,
    ) -> Result<Values, ExceptionCode> {
        let table = self.table();
        let segments = table.resolve(class, address, count)?;
        Ok(table.read(class, &segments))
    }

    fn write_local(
        &self,
        class: RegisterClass,
        address: Address,
        values: &Values,
    ) -> Result<(), ExceptionCode> {
        let mut table = self.table();
        let segments = table.resolve(class, address, values.len())?;
        table.write(class, &segments, values);
        Ok(())
    }

    /// Registers written from the wire since the last
    /// [`clear_changed`](Self::clear_changed), with their latest values.
    #[must_use]
    pub fn changed(&self) -> BTreeMap<(RegisterClass, Address), Values> {
        self.table().changed.clone()
    }

    pub fn clear_changed(&self) {
        self.table().changed.clear();
    }
}

fn quantity_of(len: usize) -> Result<Quantity, ExceptionCode> {
    Quantity::try_from(len).map_err(|_| ExceptionCode::IllegalDataValue)
}

// Local access for the device program. No callbacks are invoked and
// nothing is recorded as changed.
impl Store {
    pub fn coils(&self, address: Address, count: usize) -> Result<Vec<Coil>, ExceptionCode> {
        self.read_local(RegisterClass::Coil, address, count)
            .map(Values::into_bits)
    }

    pub fn set_coils(&self, address: Address, coils: &[Coil]) -> Result<(), ExceptionCode> {
        self.write_local(RegisterClass::Coil, address, &Values::Bits(coils.to_vec()))
    }

    pub fn coil(&self, address: Address) -> Result<Coil, ExceptionCode> {
        single(self.coils(address, 1)?)
    }

    pub fn set_coil(&self, address: Address, coil: Coil) -> Result<(), ExceptionCode> {
        self.set_coils(address, &[coil])
    }

    pub fn discrete_inputs(
        &self,
        address: Address,
        count: usize,
    ) -> Result<Vec<Coil>, ExceptionCode> {
        self.read_local(RegisterClass::DiscreteInput, address, count)
            .map(Values::into_bits)
    }

    pub fn set_discrete_inputs(
        &self,
        address: Address,
        inputs: &[Coil],
    ) -> Result<(), ExceptionCode> {
        self.write_local(
            RegisterClass::DiscreteInput,
            address,
            &Values::Bits(inputs.to_vec()),
        )
    }

    pub fn discrete_input(&self, address: Address) -> Result<Coil, ExceptionCode> {
        single(self.discrete_inputs(address, 1)?)
    }

    pub fn set_discrete_input(&self, address: Address, input: Coil) -> Result<(), ExceptionCode> {
        self.set_discrete_inputs(address, &[input])
    }

    pub fn holding_registers(
        &self,
        address: Address,
        count: usize,
    ) -> Result<Vec<Word>, ExceptionCode> {
        self.read_local(RegisterClass::HoldingRegister, address, count)
            .map(Values::into_words)
    }

    pub fn set_holding_registers(
        &self,
        address: Address,
        words: &[Word],
    ) -> Result<(), ExceptionCode> {
        self.write_local(
            RegisterClass::HoldingRegister,
            address,
            &Values::Words(words.to_vec()),
        )
    }

    pub fn holding_register(&self, address: Address) -> Result<Word, ExceptionCode> {
        single(self.holding_registers(address, 1)?)
    }

    pub fn set_holding_register(&self, address: Address, word: Word) -> Result<(), ExceptionCode> {
        self.set_holding_registers(address, &[word])
    }

    pub fn input_registers(
        &self,
        address: Address,
        count: usize,
    ) -> Result<Vec<Word>, ExceptionCode> {
        self.read_local(RegisterClass::InputRegister, address, count)
            .map(Values::into_words)
    }

    pub fn set_input_registers(
        &self,
        address: Address,
        words: &[Word],
    ) -> Result<(), ExceptionCode> {
        self.write_local(
            RegisterClass::InputRegister,
            address,
            &Values::Words(words.to_vec()),
        )
    }

    pub fn input_register(&self, address: Address) -> Result<Word, ExceptionCode> {
        single(self.input_registers(address, 1)?)
    }

    pub fn set_input_register(&self, address: Address, word: Word) -> Result<(), ExceptionCode> {
        self.set_input_registers(address, &[word])
    }
}

fn single<T>(values: Vec<T>) -> Result<T, ExceptionCode> {
    values
        .into_iter()
        .next()
        .ok_or(ExceptionCode::IllegalDataAddress)
}

#[cfg(test)]
mod tests {
    use std::{
        borrow::Cow,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn example_definitions() -> Definitions {
        Definitions::new()
            .with(
                RegisterClass::Coil,
                "RESET_REGISTER_DATA_COIL",
                Definition::new(42).with_default(false),
            )
            .with(
                RegisterClass::Coil,
                "EXAMPLE_COIL",
                Definition::new(123).with_default(true),
            )
            .with(
                RegisterClass::HoldingRegister,
                "EXAMPLE_HREG",
                Definition::new(93).with_default(19u16),
            )
            .with(
                RegisterClass::DiscreteInput,
                "EXAMPLE_ISTS",
                Definition::new(67).with_len(2).with_default(vec![true, false]),
            )
            .with(
                RegisterClass::InputRegister,
                "EXAMPLE_IREG",
                Definition::new(10).with_default(60001u16),
            )
    }

    #[test]
    fn bulk_setup_with_defined_values() {
        let store = Store::with_definitions(&example_definitions(), false).unwrap();
        assert_eq!(store.coils(42, 1).unwrap(), [false]);
        assert!(store.coil(123).unwrap());
        assert_eq!(store.holding_register(93).unwrap(), 19);
        assert_eq!(store.discrete_inputs(67, 2).unwrap(), [true, false]);
        assert_eq!(store.input_register(10).unwrap(), 60001);
    }

    #[test]
    fn bulk_setup_with_placeholders() {
        let store = Store::with_definitions(&example_definitions(), true).unwrap();
        assert!(store.coil(42).unwrap());
        assert!(store.coil(123).unwrap());
        assert_eq!(store.holding_register(93).unwrap(), 999);
        assert_eq!(store.discrete_inputs(67, 2).unwrap(), [true, true]);
        assert_eq!(store.input_register(10).unwrap(), 999);
    }

    #[test]
    fn reject_invalid_definitions() {
        let definitions = example_definitions().with(
            RegisterClass::HoldingRegister,
            "OVERLAPPING",
            Definition::new(92).with_len(2),
        );
        assert_eq!(
            Store::with_definitions(&definitions, false).unwrap_err(),
            ConfigError::OverlappingRegisters {
                class: RegisterClass::HoldingRegister,
                name: "OVERLAPPING".into(),
                address: 92,
            }
        );

        let definitions =
            Definitions::new().with(RegisterClass::Coil, "EMPTY", Definition::new(0).with_len(0));
        assert!(matches!(
            Store::with_definitions(&definitions, true),
            Err(ConfigError::EmptyRegister { .. })
        ));

        let definitions = Definitions::new().with(
            RegisterClass::InputRegister,
            "END",
            Definition::new(0xFFFF).with_len(2),
        );
        assert!(matches!(
            Store::with_definitions(&definitions, true),
            Err(ConfigError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn failed_setup_keeps_previous_registers() {
        let store = Store::with_definitions(&example_definitions(), false).unwrap();
        let definitions =
            Definitions::new().with(RegisterClass::Coil, "EMPTY", Definition::new(0).with_len(0));
        assert!(store.bulk_setup(&definitions, false).is_err());
        assert_eq!(store.holding_register(93).unwrap(), 19);
    }

    #[test]
    fn read_across_adjacent_entries() {
        let store = Store::new();
        store
            .add(RegisterClass::HoldingRegister, 10, vec![1u16, 2])
            .unwrap();
        store
            .add(RegisterClass::HoldingRegister, 12, vec![3u16])
            .unwrap();
        assert_eq!(
            store.get(RegisterClass::HoldingRegister, 10, 3).unwrap(),
            Values::Words(vec![1, 2, 3])
        );
        assert_eq!(
            store.get(RegisterClass::HoldingRegister, 11, 2).unwrap(),
            Values::Words(vec![2, 3])
        );
    }

    #[test]
    fn uncovered_addresses() {
        let store = Store::new();
        store
            .add(RegisterClass::HoldingRegister, 10, vec![1u16, 2])
            .unwrap();
        store
            .add(RegisterClass::HoldingRegister, 13, vec![4u16])
            .unwrap();
        assert_eq!(
            store.get(RegisterClass::HoldingRegister, 9, 1),
            Err(ExceptionCode::IllegalDataAddress)
        );
        // gap at 12
        assert_eq!(
            store.get(RegisterClass::HoldingRegister, 11, 3),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            store.set(RegisterClass::HoldingRegister, 12, &Values::from(7u16)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(store.holding_registers(10, 2).unwrap(), [1, 2]);
    }

    #[test]
    fn add_overlapping_entry() {
        let store = Store::new();
        store.add(RegisterClass::Coil, 0, vec![false; 8]).unwrap();
        assert!(matches!(
            store.add(RegisterClass::Coil, 7, true),
            Err(ConfigError::OverlappingRegisters { address: 7, .. })
        ));
        // Other classes have their own address space.
        store.add(RegisterClass::DiscreteInput, 7, true).unwrap();
    }

    #[test]
    fn pre_set_veto() {
        let set_calls = Arc::new(AtomicUsize::new(0));
        let definitions = Definitions::new().with(
            RegisterClass::HoldingRegister,
            "EXAMPLE_HREG",
            Definition::new(93)
                .with_default(19u16)
                .on_pre_set(|_, _, values| {
                    values
                        .clone()
                        .into_words()
                        .iter()
                        .any(|value| *value > 100)
                })
                .on_set({
                    let set_calls = Arc::clone(&set_calls);
                    move |_, _, _| {
                        set_calls.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );
        let store = Store::with_definitions(&definitions, false).unwrap();

        assert_eq!(
            store.dispatch(&Request::WriteSingleRegister(93, 101)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(store.holding_register(93).unwrap(), 19);
        assert_eq!(set_calls.load(Ordering::SeqCst), 0);
        assert!(store.changed().is_empty());

        assert_eq!(
            store.dispatch(&Request::WriteSingleRegister(93, 100)),
            Ok(Response::WriteSingleRegister(93, 100))
        );
        assert_eq!(store.holding_register(93).unwrap(), 100);
        assert_eq!(set_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_callback_replaces_values() {
        let definitions = Definitions::new().with(
            RegisterClass::InputRegister,
            "EXAMPLE_IREG",
            Definition::new(10)
                .with_default(60001u16)
                .on_get(|_, _, values| {
                    let words = values.clone().into_words();
                    Some(Values::Words(words.iter().map(|w| w.wrapping_add(1)).collect()))
                }),
        );
        let store = Store::with_definitions(&definitions, false).unwrap();
        assert_eq!(
            store.dispatch(&Request::ReadInputRegisters(10, 1)),
            Ok(Response::ReadInputRegisters(vec![60002]))
        );
        // The stored value is not touched.
        assert_eq!(store.input_register(10).unwrap(), 60001);
    }

    #[test]
    fn get_callback_with_wrong_length() {
        let definitions = Definitions::new().with(
            RegisterClass::Coil,
            "EXAMPLE_COIL",
            Definition::new(0)
                .with_len(2)
                .on_get(|_, _, _| Some(Values::Bits(vec![true]))),
        );
        let store = Store::with_definitions(&definitions, true).unwrap();
        assert_eq!(
            store.dispatch(&Request::ReadCoils(0, 2)),
            Err(ExceptionCode::ServerDeviceFailure)
        );
    }

    #[test]
    fn callbacks_receive_the_touched_part() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let definitions = Definitions::new().with(
            RegisterClass::HoldingRegister,
            "BLOCK",
            Definition::new(100).with_len(4).on_set({
                let seen = Arc::clone(&seen);
                move |class, address, values| {
                    seen.lock().unwrap().push((class, address, values.clone()));
                }
            }),
        );
        let store = Store::with_definitions(&definitions, true).unwrap();
        store
            .dispatch(&Request::WriteMultipleRegisters(
                101,
                Cow::Borrowed(&[7, 8]),
            ))
            .unwrap();
        assert_eq!(store.holding_registers(100, 4).unwrap(), [999, 7, 8, 999]);
        assert_eq!(
            *seen.lock().unwrap(),
            [(
                RegisterClass::HoldingRegister,
                101,
                Values::Words(vec![7, 8])
            )]
        );
    }

    #[test]
    fn read_only_classes_are_not_written_from_the_wire() {
        let store = Store::with_definitions(&example_definitions(), false).unwrap();
        // Write requests only address coils and holding registers.
        assert_eq!(
            store.dispatch(&Request::WriteSingleCoil(67, true)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            store.dispatch(&Request::WriteSingleRegister(10, 1)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(store.input_register(10).unwrap(), 60001);
    }

    #[test]
    fn local_access_skips_callbacks() {
        let definitions = Definitions::new().with(
            RegisterClass::Coil,
            "EXAMPLE_COIL",
            Definition::new(5).on_pre_set(|_, _, _| true),
        );
        let store = Store::with_definitions(&definitions, false).unwrap();
        store.set_coil(5, false).unwrap();
        assert!(!store.coil(5).unwrap());
        assert!(store.changed().is_empty());
        assert_eq!(store.set_coil(6, false), Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn track_changed_registers() {
        let store = Store::with_definitions(&example_definitions(), false).unwrap();
        store.dispatch(&Request::WriteSingleCoil(123, false)).unwrap();
        store.dispatch(&Request::WriteSingleRegister(93, 44)).unwrap();
        store.dispatch(&Request::WriteSingleRegister(93, 45)).unwrap();

        let changed = store.changed();
        assert_eq!(changed.len(), 2);
        assert_eq!(
            changed[&(RegisterClass::Coil, 123)],
            Values::Bits(vec![false])
        );
        assert_eq!(
            changed[&(RegisterClass::HoldingRegister, 93)],
            Values::Words(vec![45])
        );

        store.clear_changed();
        assert!(store.changed().is_empty());
    }

    #[test]
    fn reset_from_set_callback() {
        let store = Store::new();
        let definitions = Arc::new(Mutex::new(None::<Definitions>));
        let reset = {
            let store = store.clone();
            let definitions = Arc::clone(&definitions);
            move |_, _, _: &Values| {
                if let Some(definitions) = definitions.lock().unwrap().as_ref() {
                    store.bulk_setup(definitions, false).unwrap();
                }
            }
        };
        let mut complete = example_definitions();
        complete
            .get_mut(RegisterClass::Coil, "RESET_REGISTER_DATA_COIL")
            .unwrap()
            .on_set = Some(Arc::new(reset));
        *definitions.lock().unwrap() = Some(complete.clone());
        store.bulk_setup(&complete, false).unwrap();

        store.dispatch(&Request::WriteSingleRegister(93, 44)).unwrap();
        assert_eq!(store.holding_register(93).unwrap(), 44);

        store.dispatch(&Request::WriteSingleCoil(42, true)).unwrap();
        assert_eq!(store.holding_register(93).unwrap(), 19);
        assert!(!store.coil(42).unwrap());
        assert!(store.changed().is_empty());

        // Still usable after the reset.
        store.dispatch(&Request::WriteSingleRegister(93, 45)).unwrap();
        assert_eq!(store.holding_register(93).unwrap(), 45);
    }
}
