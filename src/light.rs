//! Ambient light monitor on an APDS-9160-class colour sensor (I2C 0x52).
//!
//! The terminal only uses the variation interrupt: the sensor raises its INT
//! pin when the green channel moves by more than the threshold for `persist`
//! consecutive measurements, which wakes the MCU to look for a QR code held in
//! front of the camera.

use embedded_hal::i2c::I2c;

pub const ADDRESS: u8 = 0x52;
pub const PART_ID: u8 = 0xC2;

const REG_MAIN_CTRL: u8 = 0x00;
const REG_PART_ID: u8 = 0x06;
const REG_MAIN_STATUS: u8 = 0x07;
const REG_LS_DATA_GREEN_0: u8 = 0x0D;
const REG_INT_CFG: u8 = 0x19;
const REG_INT_PST: u8 = 0x1A;
const REG_LS_THRES_VAR: u8 = 0x27;

const MAIN_CTRL_LS_EN: u8 = 0x02;
// LS_VAR_MODE | LS_INT_EN | LS_INT_SEL=0b01 (green channel)
const INT_CFG_LS_VARIATION: u8 = 0x1C;
const INT_PST_LS_MASK: u8 = 0xF0;
const MAIN_STATUS_LS_INT: u8 = 0x10;

pub const MAX_THRESHOLD_EXP: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LightSensorError<E: core::fmt::Debug> {
    #[error("i2c transfer failed: {0:?}")]
    Bus(E),
    #[error("unexpected part id 0x{0:02X}")]
    PartId(u8),
}

/// Raw variation threshold for `exp` (clamped to 0..=7): `8 * 2^exp`.
pub const fn variation_threshold(exp: u8) -> u32 {
    let exp = if exp > MAX_THRESHOLD_EXP { MAX_THRESHOLD_EXP } else { exp };
    8 << exp
}

pub struct LightMonitor<I: I2c> {
    i2c: I,
}

impl<I: I2c> LightMonitor<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn release(self) -> I {
        self.i2c
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, LightSensorError<I::Error>> {
        let mut value = [0u8; 1];
        self.i2c
            .write_read(ADDRESS, &[reg], &mut value)
            .map_err(LightSensorError::Bus)?;
        Ok(value[0])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), LightSensorError<I::Error>> {
        self.i2c.write(ADDRESS, &[reg, value]).map_err(LightSensorError::Bus)
    }

    fn update_reg(
        &mut self,
        reg: u8,
        f: impl FnOnce(u8) -> u8,
    ) -> Result<(), LightSensorError<I::Error>> {
        let current = self.read_reg(reg)?;
        self.write_reg(reg, f(current))
    }

    /// Check the part id register.
    pub fn probe(&mut self) -> Result<(), LightSensorError<I::Error>> {
        let id = self.read_reg(REG_PART_ID)?;
        if id != PART_ID {
            log::error!("light: unexpected part id 0x{:02X}", id);
            return Err(LightSensorError::PartId(id));
        }
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), LightSensorError<I::Error>> {
        self.update_reg(REG_MAIN_CTRL, |r| r | MAIN_CTRL_LS_EN)
    }

    pub fn deactivate(&mut self) -> Result<(), LightSensorError<I::Error>> {
        self.update_reg(REG_MAIN_CTRL, |r| r & !MAIN_CTRL_LS_EN)
    }

    pub fn enable_variation_interrupt(&mut self) -> Result<(), LightSensorError<I::Error>> {
        self.update_reg(REG_INT_CFG, |r| r | INT_CFG_LS_VARIATION)
    }

    /// Consecutive measurements (1..=16, clamped) needed to raise the interrupt.
    pub fn set_persist(&mut self, measurements: u8) -> Result<(), LightSensorError<I::Error>> {
        let persist = (measurements.clamp(1, 16) - 1) << 4;
        self.update_reg(REG_INT_PST, |r| (r & !INT_PST_LS_MASK) | persist)
    }

    /// Set the variation threshold exponent (threshold = 8 * 2^exp, exp clamped to 7).
    pub fn configure(&mut self, threshold_exp: u8) -> Result<(), LightSensorError<I::Error>> {
        let exp = threshold_exp.min(MAX_THRESHOLD_EXP);
        if exp != threshold_exp {
            log::warn!("light: threshold exponent {} clamped to {}", threshold_exp, exp);
        }
        self.write_reg(REG_LS_THRES_VAR, exp)
    }

    /// Full bring-up: probe, threshold, persistence, interrupt, sensor on.
    pub fn init(&mut self, threshold_exp: u8, persist: u8) -> Result<(), LightSensorError<I::Error>> {
        self.probe()?;
        self.configure(threshold_exp)?;
        self.set_persist(persist)?;
        self.enable_variation_interrupt()?;
        self.activate()?;
        log::info!(
            "light: variation interrupt armed (threshold {}, persist {})",
            variation_threshold(threshold_exp),
            persist.clamp(1, 16)
        );
        Ok(())
    }

    /// Read and acknowledge the light interrupt status bit.
    ///
    /// MAIN_STATUS clears on read, so call this once per handled wake.
    pub fn read_status(&mut self) -> Result<bool, LightSensorError<I::Error>> {
        Ok(self.read_reg(REG_MAIN_STATUS)? & MAIN_STATUS_LS_INT != 0)
    }

    /// 24-bit green channel reading.
    pub fn read_value(&mut self) -> Result<u32, LightSensorError<I::Error>> {
        let mut bytes = [0u8; 3];
        self.i2c
            .write_read(ADDRESS, &[REG_LS_DATA_GREEN_0], &mut bytes)
            .map_err(LightSensorError::Bus)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }
}
