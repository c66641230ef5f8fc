// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Register definitions for [`Store::bulk_setup`](super::Store::bulk_setup).

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{error::ConfigError, frame::Address};

use super::{GetCallback, PreSetCallback, RegisterClass, SetCallback, Values};

/// Initial value of a register entry.
///
/// A single value is repeated for every address of the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(untagged))]
pub enum DefaultValue {
    Bool(bool),
    Word(u16),
    Bools(Vec<bool>),
    Words(Vec<u16>),
}

impl DefaultValue {
    pub(crate) fn to_values(
        &self,
        class: RegisterClass,
        name: &str,
        len: usize,
    ) -> Result<Values, ConfigError> {
        let values = match (self, class.is_bit()) {
            (Self::Bool(bit), true) => Values::Bits(vec![*bit; len]),
            (Self::Bool(bit), false) => Values::Words(vec![u16::from(*bit); len]),
            (Self::Word(word), true) => Values::Bits(vec![*word != 0; len]),
            (Self::Word(word), false) => Values::Words(vec![*word; len]),
            (Self::Bools(bits), true) => Values::Bits(bits.clone()),
            (Self::Bools(bits), false) => {
                Values::Words(bits.iter().copied().map(u16::from).collect())
            }
            (Self::Words(words), true) => Values::Bits(words.iter().map(|w| *w != 0).collect()),
            (Self::Words(words), false) => Values::Words(words.clone()),
        };
        if values.len() != len {
            return Err(ConfigError::DefaultLength {
                class,
                name: name.to_owned(),
                expected: len,
                actual: values.len(),
            });
        }
        Ok(values)
    }
}

impl From<bool> for DefaultValue {
    fn from(from: bool) -> Self {
        Self::Bool(from)
    }
}

impl From<u16> for DefaultValue {
    fn from(from: u16) -> Self {
        Self::Word(from)
    }
}

impl From<Vec<bool>> for DefaultValue {
    fn from(from: Vec<bool>) -> Self {
        Self::Bools(from)
    }
}

impl From<Vec<u16>> for DefaultValue {
    fn from(from: Vec<u16>) -> Self {
        Self::Words(from)
    }
}

#[cfg(feature = "serde")]
const fn default_len() -> u16 {
    1
}

/// One named register entry.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Definition {
    #[cfg_attr(feature = "serde", serde(rename = "register"))]
    pub address: Address,

    #[cfg_attr(feature = "serde", serde(default = "default_len"))]
    pub len: u16,

    /// Falls back to the placeholder value if missing.
    #[cfg_attr(feature = "serde", serde(rename = "val", default))]
    pub default: Option<DefaultValue>,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub on_get: Option<GetCallback>,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub on_set: Option<SetCallback>,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub on_pre_set: Option<PreSetCallback>,
}

impl Definition {
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            len: 1,
            default: None,
            on_get: None,
            on_set: None,
            on_pre_set: None,
        }
    }

    #[must_use]
    pub fn with_len(mut self, len: u16) -> Self {
        self.len = len;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<DefaultValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Runs after a read and may replace the values that are returned.
    #[must_use]
    pub fn on_get<F>(mut self, callback: F) -> Self
    where
        F: Fn(RegisterClass, Address, &Values) -> Option<Values> + Send + Sync + 'static,
    {
        self.on_get = Some(Arc::new(callback));
        self
    }

    /// Runs after a successful write from the wire.
    #[must_use]
    pub fn on_set<F>(mut self, callback: F) -> Self
    where
        F: Fn(RegisterClass, Address, &Values) + Send + Sync + 'static,
    {
        self.on_set = Some(Arc::new(callback));
        self
    }

    /// Runs before a write from the wire. Returning `true` rejects the
    /// write.
    #[must_use]
    pub fn on_pre_set<F>(mut self, callback: F) -> Self
    where
        F: Fn(RegisterClass, Address, &Values) -> bool + Send + Sync + 'static,
    {
        self.on_pre_set = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("address", &self.address)
            .field("len", &self.len)
            .field("default", &self.default)
            .field("on_get", &self.on_get.is_some())
            .field("on_set", &self.on_set.is_some())
            .field("on_pre_set", &self.on_pre_set.is_some())
            .finish()
    }
}

/// Named register entries of all four classes.
///
/// The serialized form uses the keys `COILS`, `ISTS`, `HREGS` and `IREGS`.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Definitions {
    #[cfg_attr(feature = "serde", serde(rename = "COILS", default))]
    pub coils: BTreeMap<String, Definition>,

    #[cfg_attr(feature = "serde", serde(rename = "ISTS", default))]
    pub discrete_inputs: BTreeMap<String, Definition>,

    #[cfg_attr(feature = "serde", serde(rename = "HREGS", default))]
    pub holding_registers: BTreeMap<String, Definition>,

    #[cfg_attr(feature = "serde", serde(rename = "IREGS", default))]
    pub input_registers: BTreeMap<String, Definition>,
}

impl Definitions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn class(&self, class: RegisterClass) -> &BTreeMap<String, Definition> {
        match class {
            RegisterClass::Coil => &self.coils,
            RegisterClass::DiscreteInput => &self.discrete_inputs,
            RegisterClass::HoldingRegister => &self.holding_registers,
            RegisterClass::InputRegister => &self.input_registers,
        }
    }

    pub fn class_mut(&mut self, class: RegisterClass) -> &mut BTreeMap<String, Definition> {
        match class {
            RegisterClass::Coil => &mut self.coils,
            RegisterClass::DiscreteInput => &mut self.discrete_inputs,
            RegisterClass::HoldingRegister => &mut self.holding_registers,
            RegisterClass::InputRegister => &mut self.input_registers,
        }
    }

    /// Adds or replaces a named entry.
    #[must_use]
    pub fn with(mut self, class: RegisterClass, name: impl Into<String>, definition: Definition) -> Self {
        self.class_mut(class).insert(name.into(), definition);
        self
    }

    /// Looks up a named entry for adding callbacks after loading.
    pub fn get_mut(&mut self, class: RegisterClass, name: &str) -> Option<&mut Definition> {
        self.class_mut(class).get_mut(name)
    }
}
