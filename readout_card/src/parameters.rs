// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Channel parameters and the small enums they are built from.

use crate::error::Error;
use crate::error::Result;
use std::fmt;
use std::str::FromStr;

/// A PCI geographic address (`domain:bus:device.function`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Accepts `bus:device.function` or `domain:bus:device.function`, all hex.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Parameter(format!("malformed PCI address '{s}'"));
        let (rest, function) = s.rsplit_once('.').ok_or_else(bad)?;
        let function = u8::from_str_radix(function, 16).map_err(|_| bad())?;
        let mut parts = rest.rsplit(':');
        let device = parts.next().ok_or_else(bad)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| bad())?;
        let bus = parts.next().ok_or_else(bad)?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| bad())?;
        let domain = match parts.next() {
            Some(domain) => u16::from_str_radix(domain, 16).map_err(|_| bad())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

/// Identifies a card either by serial number or by PCI address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardId {
    Serial(i32),
    Address(PciAddress),
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardId::Serial(serial) => write!(f, "{serial}"),
            CardId::Address(address) => write!(f, "{address}"),
        }
    }
}

impl FromStr for CardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(serial) = s.parse::<i32>() {
            return Ok(CardId::Serial(serial));
        }
        Ok(CardId::Address(s.parse()?))
    }
}

/// The two supported card families.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    Crorc,
    Cru,
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardType::Crorc => write!(f, "CRORC"),
            CardType::Cru => write!(f, "CRU"),
        }
    }
}

/// Where the data stream originates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Card-internal generator looped back into the receiver.
    Internal,
    /// Front-end electronics over the optical link.
    Fee,
    /// SIU-side loopback.
    Siu,
    /// DIU-side loopback.
    Diu,
    /// The CRU firmware's embedded data generator.
    Ddg,
}

impl DataSource {
    /// True for sources on the far side of the optical link.
    pub fn is_external(&self) -> bool {
        matches!(self, DataSource::Fee | DataSource::Siu | DataSource::Diu)
    }
}

impl FromStr for DataSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INTERNAL" => Ok(DataSource::Internal),
            "FEE" => Ok(DataSource::Fee),
            "SIU" => Ok(DataSource::Siu),
            "DIU" => Ok(DataSource::Diu),
            "DDG" => Ok(DataSource::Ddg),
            _ => Err(Error::Parameter(format!("unknown data source '{s}'"))),
        }
    }
}

/// How deep a channel reset reaches. Each level performs all the work of the
/// levels below it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetLevel {
    Nothing,
    Internal,
    InternalDiu,
    InternalDiuSiu,
}

/// The pattern the data generator emits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GeneratorPattern {
    Incremental,
    Alternating,
    Constant,
}

impl FromStr for GeneratorPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INCREMENTAL" => Ok(GeneratorPattern::Incremental),
            "ALTERNATING" => Ok(GeneratorPattern::Alternating),
            "CONSTANT" => Ok(GeneratorPattern::Constant),
            _ => Err(Error::Parameter(format!("unknown generator pattern '{s}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadoutMode {
    Continuous,
}

impl FromStr for ReadoutMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CONTINUOUS" => Ok(ReadoutMode::Continuous),
            _ => Err(Error::Parameter(format!("unknown readout mode '{s}'"))),
        }
    }
}

/// Everything a channel needs to know before it touches the card.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub card_id: CardId,
    pub channel_number: u32,
    /// Hardware transport unit in bytes. The C-RORC only supports 8 KiB.
    pub dma_page_size: usize,
    pub data_source: DataSource,
    pub generator_pattern: GeneratorPattern,
    /// Event size the generator is armed with, in bytes.
    pub generator_data_size: usize,
    pub readout_mode: Option<ReadoutMode>,
    /// Use STBRD instead of RDYRX when triggering the front-end.
    pub stbrd_enabled: bool,
}

impl Parameters {
    pub const DEFAULT_DMA_PAGE_SIZE: usize = 8192;

    pub fn new(card_id: CardId, channel_number: u32) -> Self {
        Self {
            card_id,
            channel_number,
            dma_page_size: Self::DEFAULT_DMA_PAGE_SIZE,
            data_source: DataSource::Internal,
            generator_pattern: GeneratorPattern::Incremental,
            generator_data_size: Self::DEFAULT_DMA_PAGE_SIZE,
            readout_mode: None,
            stbrd_enabled: false,
        }
    }

    pub fn with_dma_page_size(mut self, dma_page_size: usize) -> Self {
        self.dma_page_size = dma_page_size;
        self
    }

    pub fn with_data_source(mut self, data_source: DataSource) -> Self {
        self.data_source = data_source;
        self
    }

    pub fn with_generator_pattern(mut self, pattern: GeneratorPattern) -> Self {
        self.generator_pattern = pattern;
        self
    }

    pub fn with_generator_data_size(mut self, size: usize) -> Self {
        self.generator_data_size = size;
        self
    }

    pub fn with_readout_mode(mut self, mode: ReadoutMode) -> Self {
        self.readout_mode = Some(mode);
        self
    }

    pub fn with_stbrd_enabled(mut self, stbrd: bool) -> Self {
        self.stbrd_enabled = stbrd;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_pci_address() {
        let address: PciAddress = "42:0.0".parse().unwrap();
        assert_eq!(
            address,
            PciAddress {
                domain: 0,
                bus: 0x42,
                device: 0,
                function: 0
            }
        );
        assert_eq!(address.to_string(), "0000:42:00.0");
    }

    #[test]
    fn parses_full_pci_address() {
        let address: PciAddress = "0001:3b:00.1".parse().unwrap();
        assert_eq!(
            address,
            PciAddress {
                domain: 1,
                bus: 0x3b,
                device: 0,
                function: 1
            }
        );
    }

    #[test]
    fn rejects_malformed_pci_address() {
        assert!("3b.00:0".parse::<PciAddress>().is_err());
        assert!("".parse::<PciAddress>().is_err());
        assert!("1:2:3:4.5".parse::<PciAddress>().is_err());
    }

    #[test]
    fn card_id_prefers_serial() {
        assert_eq!("12345".parse::<CardId>().unwrap(), CardId::Serial(12345));
        assert!(matches!(
            "42:0.0".parse::<CardId>().unwrap(),
            CardId::Address(_)
        ));
    }

    #[test]
    fn reset_levels_are_ordered() {
        assert!(ResetLevel::Nothing < ResetLevel::Internal);
        assert!(ResetLevel::Internal < ResetLevel::InternalDiu);
        assert!(ResetLevel::InternalDiu < ResetLevel::InternalDiuSiu);
    }
}
