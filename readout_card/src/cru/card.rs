// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CRU command primitives and configuration.

use super::regs::bar2;
use super::regs::data_source;
use super::regs::link;
use super::regs::reg;
use super::regs::SuperpageSizeWord;
use super::regs::MAX_LINKS;
use super::regs::SUPERPAGE_SIZE_FIFO_POKE;
use crate::bar;
use crate::bar::SharedBar;
use crate::error::Error;
use crate::error::Result;
use crate::parameters::DataSource;

/// The subset of card configuration the driver owns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CruConfig {
    pub data_source: DataSource,
    /// Per-wrapper link enable masks.
    pub links_enabled: [u32; 2],
    pub trigger_window_size: u32,
    pub cru_id: u16,
}

impl Default for CruConfig {
    fn default() -> Self {
        Self {
            data_source: DataSource::Internal,
            links_enabled: [0x1, 0x0],
            trigger_window_size: 1000,
            cru_id: 0,
        }
    }
}

/// What the card currently reports, compared against [`CruConfig`] by
/// [`CruBar::reconfigure`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReportInfo {
    pub data_source: DataSource,
    pub links_enabled: [u32; 2],
    pub trigger_window_size: u32,
    pub cru_id: u16,
    pub wrapper_count: u32,
}

/// Typed front-end for a CRU's BARs. BAR 2 is optional; management reads
/// return `None` without it.
pub struct CruBar {
    bar0: SharedBar,
    bar2: Option<SharedBar>,
    wrapper_count: Option<u32>,
    superpage_size_index: [u8; MAX_LINKS as usize],
}

impl CruBar {
    pub fn new(bar0: SharedBar, bar2: Option<SharedBar>) -> Self {
        assert_eq!(bar0.index(), 0);
        if let Some(bar2) = &bar2 {
            assert_eq!(bar2.index(), 2);
        }
        Self {
            bar0,
            bar2,
            wrapper_count: None,
            superpage_size_index: [0; MAX_LINKS as usize],
        }
    }

    pub fn bar0(&self) -> &SharedBar {
        &self.bar0
    }

    fn bar2(&self, what: &str) -> Option<&SharedBar> {
        if self.bar2.is_none() {
            tracing::debug!(what, "no BAR 2 mapping, management read skipped");
        }
        self.bar2.as_ref()
    }

    /// Pushes a superpage descriptor into a link's FIFO.
    pub fn push_superpage_descriptor(&self, link_nr: u32, pages: u32, bus_address: u64) {
        // The address writes are buffered on the firmware side; the page
        // count write performs the push.
        self.bar0.write(
            link::superpage_address_high(link_nr),
            (bus_address >> 32) as u32,
        );
        self.bar0
            .write(link::superpage_address_low(link_nr), bus_address as u32);
        self.bar0.write(link::superpage_pages(link_nr), pages);
    }

    /// Superpages the link has completed since DMA start.
    pub fn superpage_count(&self, link_nr: u32) -> u32 {
        self.bar0.read(link::superpage_count(link_nr))
    }

    /// Pops the next entry of the link's size FIFO. Returns 0 on firmware
    /// without a size FIFO.
    pub fn superpage_size(&mut self, link_nr: u32) -> u32 {
        let register = link::superpage_size(link_nr);
        self.bar0.write(register, SUPERPAGE_SIZE_FIFO_POKE);
        let mut word = SuperpageSizeWord::from(self.bar0.read(register));
        if word.size() == 0 {
            return 0;
        }
        // Re-read until the rolling index catches up; the PCIe bus can be
        // slower than the firmware's FIFO update.
        let expected = self.superpage_size_index[link_nr as usize];
        while word.index() != expected {
            word = SuperpageSizeWord::from(self.bar0.read(register));
        }
        self.superpage_size_index[link_nr as usize] = expected.wrapping_add(1);
        word.size()
    }

    pub fn set_data_emulator_enabled(&self, enabled: bool) {
        self.bar0
            .write(reg::DMA_CONTROL, if enabled { 0x1 } else { 0x0 });
        let mut bits = self.bar0.read(reg::DATA_GENERATOR_CONTROL);
        if enabled {
            bits |= 0x1;
        } else {
            bits &= !0x1;
        }
        self.bar0.write(reg::DATA_GENERATOR_CONTROL, bits);
    }

    pub fn set_data_source(&self, source: DataSource) -> Result<()> {
        let value = match source {
            DataSource::Fee => data_source::GBT,
            DataSource::Internal => data_source::INTERNAL,
            DataSource::Ddg => data_source::DDG,
            DataSource::Siu | DataSource::Diu => {
                return Err(Error::Parameter(format!(
                    "CRU does not support the {source:?} data source"
                )));
            }
        };
        self.bar0.write(reg::DATA_SOURCE_SELECT, value);
        Ok(())
    }

    fn read_data_source(&self) -> DataSource {
        match self.bar0.read(reg::DATA_SOURCE_SELECT) {
            data_source::GBT => DataSource::Fee,
            data_source::DDG => DataSource::Ddg,
            _ => DataSource::Internal,
        }
    }

    pub fn reset_card(&self) {
        self.bar0.write(reg::RESET_CONTROL, 0x1);
    }

    pub fn reset_data_generator_counter(&self) {
        self.bar0.write(reg::RESET_CONTROL, 0x2);
    }

    /// Injects a single error into the generated data stream.
    pub fn data_generator_inject_error(&self) {
        self.bar0.write(reg::DATA_GENERATOR_INJECT_ERROR, 0x1);
    }

    pub fn enable_data_taking(&self) {
        bar::modify(self.bar0.as_ref(), reg::BSP_USER_CONTROL, 0, 1, 0x1);
    }

    pub fn disable_data_taking(&self) {
        bar::modify(self.bar0.as_ref(), reg::BSP_USER_CONTROL, 0, 1, 0x0);
    }

    pub fn set_cru_id(&self, cru_id: u16) {
        bar::modify(
            self.bar0.as_ref(),
            reg::BSP_USER_CONTROL,
            16,
            12,
            cru_id as u32,
        );
    }

    pub fn cru_id(&self) -> u16 {
        bar::bits(self.bar0.read(reg::BSP_USER_CONTROL), 16, 27) as u16
    }

    pub fn endpoint_number(&self) -> i32 {
        match self.bar0.read(reg::ENDPOINT_ID) {
            0x0 => 0,
            0x11111111 => 1,
            _ => -1,
        }
    }

    pub fn dropped_packets(&self, wrapper: u32) -> u32 {
        self.bar0.read(reg::dropped_packets(wrapper))
    }

    pub fn total_packets_per_second(&self, wrapper: u32) -> u32 {
        self.bar0.read(reg::total_packets_per_second(wrapper))
    }

    /// Counts live wrappers by sampling each one's free-running clock
    /// counter twice.
    pub fn wrapper_count(&mut self) -> u32 {
        if let Some(count) = self.wrapper_count {
            return count;
        }
        let mut count = 0;
        for wrapper in 0..2 {
            let a = self.bar0.read(reg::wrapper_clock_counter(wrapper));
            let b = self.bar0.read(reg::wrapper_clock_counter(wrapper));
            if a != b {
                count += 1;
            }
        }
        self.wrapper_count = Some(count);
        count
    }

    pub fn links_per_wrapper(&self, wrapper: u32) -> u32 {
        bar::bits(self.bar0.read(reg::wrapper_config(wrapper)), 24, 31)
    }

    pub fn link_count(&self) -> u32 {
        self.links_per_wrapper(0) + self.links_per_wrapper(1)
    }

    /// Reads back the configuration the card is currently running with.
    pub fn report(&mut self) -> ReportInfo {
        ReportInfo {
            data_source: self.read_data_source(),
            links_enabled: [
                self.bar0.read(reg::links_enable(0)),
                self.bar0.read(reg::links_enable(1)),
            ],
            trigger_window_size: self.bar0.read(reg::trigger_window_size(0)),
            cru_id: self.cru_id(),
            wrapper_count: self.wrapper_count(),
        }
    }

    /// Applies `config` unconditionally.
    pub fn configure(&mut self, config: &CruConfig) -> Result<()> {
        tracing::info!("configuring CRU");
        self.disable_data_taking();
        self.set_data_source(config.data_source)?;
        self.set_cru_id(config.cru_id);

        tracing::debug!("enabling links and setting the trigger window");
        for wrapper in 0..2 {
            self.bar0
                .write(reg::links_enable(wrapper), config.links_enabled[wrapper as usize]);
            self.bar0
                .write(reg::trigger_window_size(wrapper), config.trigger_window_size);
        }
        tracing::info!("CRU configuration done");
        Ok(())
    }

    /// Applies `config` only if the card is not already running it.
    pub fn reconfigure(&mut self, config: &CruConfig) -> Result<()> {
        let report = self.report();
        if report.data_source == config.data_source
            && report.links_enabled == config.links_enabled
            && report.trigger_window_size == config.trigger_window_size
            && report.cru_id == config.cru_id
        {
            tracing::info!("no need to reconfigure further");
            return Ok(());
        }
        self.configure(config)
    }

    pub fn serial(&self) -> Option<i32> {
        let bar2 = self.bar2("serial")?;
        match bar2.read(bar2::SERIAL) {
            0 | u32::MAX => None,
            serial => Some(serial as i32),
        }
    }

    /// Temperature in degrees Celsius, if the sensor reading is valid.
    pub fn temperature(&self) -> Option<f32> {
        let bar2 = self.bar2("temperature")?;
        convert_temperature_raw(bar2.read(bar2::TEMPERATURE) & 0x3ff)
    }

    pub fn firmware_info(&self) -> Option<String> {
        let bar2 = self.bar2("firmware info")?;
        Some(format!(
            "{:x}-{:x}-{:x}",
            bar2.read(bar2::FIRMWARE_DATE),
            bar2.read(bar2::FIRMWARE_TIME),
            bar2.read(bar2::FIRMWARE_GIT_HASH),
        ))
    }

    pub fn chip_id(&self) -> Option<String> {
        let bar2 = self.bar2("chip id")?;
        Some(format!(
            "{:08x}-{:08x}",
            bar2.read(bar2::FPGA_CHIP_HIGH),
            bar2.read(bar2::FPGA_CHIP_LOW),
        ))
    }
}

/// Conversion formula from the FPGA vendor's sensor documentation. The
/// register is 10 bits; 0 and overrange read as invalid.
fn convert_temperature_raw(register_value: u32) -> Option<f32> {
    const REGISTER_MAX_VALUE: u32 = 1023;
    if register_value == 0 || register_value > REGISTER_MAX_VALUE {
        return None;
    }
    Some(((693.0 * register_value as f32) / 1024.0) - 265.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_conversion() {
        assert_eq!(convert_temperature_raw(0), None);
        assert_eq!(convert_temperature_raw(1024), None);
        let mid = convert_temperature_raw(512).unwrap();
        assert!((mid - 81.5).abs() < 1.0);
    }
}
