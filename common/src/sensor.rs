use crate::error::SensorReadError;

pub trait TemperatureSource {
    fn read_celsius(&mut self) -> Result<f32, SensorReadError>;
}

pub trait AdcChannel {
    fn read_raw(&mut self) -> Result<u16, SensorReadError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearAdcConversion {
    pub vref: f32,
    pub full_scale: f32,
    pub offset_volts: f32,
    pub slope_volts_per_degree: f32,
    pub reference_celsius: f32,
}

impl Default for LinearAdcConversion {
    /// RP2040 on-die sensor: 0.706 V at 27 °C, -1.721 mV/°C, 16-bit reads.
    fn default() -> Self {
        Self {
            vref: 3.3,
            full_scale: 65_535.0,
            offset_volts: 0.706,
            slope_volts_per_degree: 0.001_721,
            reference_celsius: 27.0,
        }
    }
}

impl LinearAdcConversion {
    pub fn celsius(&self, raw: u16) -> f32 {
        let volts = raw as f32 * (self.vref / self.full_scale);
        self.reference_celsius - (volts - self.offset_volts) / self.slope_volts_per_degree
    }
}

pub struct AdcTemperature<A> {
    channel: A,
    conversion: LinearAdcConversion,
}

impl<A: AdcChannel> AdcTemperature<A> {
    pub fn new(channel: A, conversion: LinearAdcConversion) -> Self {
        Self {
            channel,
            conversion,
        }
    }
}

impl<A: AdcChannel> TemperatureSource for AdcTemperature<A> {
    fn read_celsius(&mut self) -> Result<f32, SensorReadError> {
        let raw = self.channel.read_raw()?;
        let celsius = self.conversion.celsius(raw);
        if !celsius.is_finite() {
            return Err(SensorReadError::new(format!(
                "adc value {raw} converted to {celsius}"
            )));
        }
        Ok(celsius)
    }
}

/// Deterministic stand-in for hosts without an ADC.
#[derive(Debug, Clone)]
pub struct SimulatedTemperature {
    mean_celsius: f32,
    tick: u64,
}

impl SimulatedTemperature {
    pub fn new(mean_celsius: f32) -> Self {
        Self {
            mean_celsius,
            tick: 0,
        }
    }
}

impl TemperatureSource for SimulatedTemperature {
    fn read_celsius(&mut self) -> Result<f32, SensorReadError> {
        self.tick = self.tick.saturating_add(1);
        let drift = (self.tick % 8) as f32 * 0.2 - 0.8;
        Ok(self.mean_celsius + drift)
    }
}
