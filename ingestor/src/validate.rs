use crate::errors::{Error, Result};
use crate::payload::{GatewayAmbient, LeafTelemetry, PairingRequest, ReservoirTelemetry};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;
const PH_MIN: f64 = 0.0;
const PH_MAX: f64 = 14.0;
const EC_MAX: f64 = 20.0;
const TDS_MAX: f64 = 10_000.0;
const LUX_MAX: f64 = 200_000.0;
const LEVEL_CM_MAX: f64 = 500.0;
const VBAT_MAX_MV: u32 = 6000;
const BRIGHTNESS_MAX: u16 = 255;

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, v, min, max
        ))),
        _ => Ok(()),
    }
}

/// Device and coordinator ids become topic segments and storage keys.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", kind)));
    }
    if id.contains(['/', '+', '#']) {
        return Err(Error::Validation(format!(
            "{} '{}' contains topic wildcard or separator",
            kind, id
        )));
    }
    Ok(())
}

pub fn validate_gateway(t: &GatewayAmbient) -> Result<()> {
    check_range("Temperature", t.temp_c, TEMP_MIN, TEMP_MAX)?;
    check_range("Light", t.light_lux, 0.0, LUX_MAX)?;
    Ok(())
}

pub fn validate_reservoir(t: &ReservoirTelemetry) -> Result<()> {
    check_range("Temperature", t.temp_c, TEMP_MIN, TEMP_MAX)?;
    check_range("Water temperature", t.water_temp_c, TEMP_MIN, TEMP_MAX)?;
    check_range("pH", t.ph, PH_MIN, PH_MAX)?;
    check_range("EC", t.ec_ms_cm, 0.0, EC_MAX)?;
    check_range("TDS", t.tds_ppm, 0.0, TDS_MAX)?;
    check_range("Water level", t.water_level_pct, PERCENT_MIN, PERCENT_MAX)?;
    check_range("Water level cm", t.water_level_cm, 0.0, LEVEL_CM_MAX)?;
    Ok(())
}

pub fn validate_leaf(t: &LeafTelemetry) -> Result<()> {
    check_range("Temperature", t.air_temp_c, TEMP_MIN, TEMP_MAX)?;
    check_range("Humidity", t.humidity_pct, PERCENT_MIN, PERCENT_MAX)?;
    check_range("Light", t.light_lux, 0.0, LUX_MAX)?;

    if let Some(mv) = t.vbat_mv {
        if mv > VBAT_MAX_MV {
            return Err(Error::Validation(format!(
                "Battery {}mV out of range [0, {}]",
                mv, VBAT_MAX_MV
            )));
        }
    }

    if let Some(b) = t.light_brightness {
        if b > BRIGHTNESS_MAX {
            return Err(Error::Validation(format!(
                "Brightness {} out of range [0, {}]",
                b, BRIGHTNESS_MAX
            )));
        }
    }

    Ok(())
}

pub fn validate_pairing_request(r: &PairingRequest) -> Result<()> {
    validate_id("Tower ID", &r.tower_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_leaf() {
        let t = LeafTelemetry {
            air_temp_c: Some(25.0),
            humidity_pct: Some(60.0),
            vbat_mv: Some(3700),
            ..Default::default()
        };

        assert!(validate_leaf(&t).is_ok());
    }

    #[test]
    fn test_invalid_temperature() {
        let t = LeafTelemetry {
            air_temp_c: Some(150.0), // Out of range
            ..Default::default()
        };

        assert!(validate_leaf(&t).is_err());
    }

    #[test]
    fn test_invalid_humidity() {
        let t = LeafTelemetry {
            humidity_pct: Some(150.0), // Out of range
            ..Default::default()
        };

        assert!(validate_leaf(&t).is_err());
    }

    #[test]
    fn test_invalid_ph() {
        let t = ReservoirTelemetry {
            ph: Some(15.2),
            ..Default::default()
        };

        assert!(validate_reservoir(&t).is_err());
    }

    #[test]
    fn test_missing_fields_are_fine() {
        assert!(validate_reservoir(&ReservoirTelemetry::default()).is_ok());
        assert!(validate_gateway(&GatewayAmbient::default()).is_ok());
    }

    #[test]
    fn test_ids() {
        assert!(validate_id("Tower ID", "tower-1").is_ok());
        assert!(validate_id("Tower ID", "").is_err());
        assert!(validate_id("Tower ID", "  ").is_err());
        assert!(validate_id("Tower ID", "a/b").is_err());
        assert!(validate_id("Tower ID", "t#").is_err());
    }
}
