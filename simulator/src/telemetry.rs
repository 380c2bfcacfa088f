use rand::Rng;
use serde::Serialize;

/// Bounded random walk.
#[derive(Debug, Clone)]
pub struct Walk {
    value: f64,
    min: f64,
    max: f64,
    step: f64,
}

impl Walk {
    pub fn new(start: f64, min: f64, max: f64, step: f64) -> Self {
        Self {
            value: start.clamp(min, max),
            min,
            max,
            step,
        }
    }

    pub fn next(&mut self, rng: &mut impl Rng) -> f64 {
        self.value = (self.value + rng.gen_range(-self.step..=self.step)).clamp(self.min, self.max);
        self.value
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TowerTelemetry {
    pub air_temp_c: f64,
    pub humidity_pct: f64,
    pub light_lux: f64,
    pub pump_on: bool,
    pub light_on: bool,
    pub status_mode: &'static str,
    pub vbat_mv: u32,
    pub fw_version: &'static str,
    pub uptime_s: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservoirTelemetry {
    pub ph: f64,
    pub ec_ms_cm: f64,
    pub water_temp_c: f64,
    pub water_level_pct: f64,
    pub main_pump_on: bool,
    pub towers_online: u32,
    pub status_mode: &'static str,
    pub uptime_s: u64,
}

pub const FW_VERSION: &str = "1.4.2";

pub struct Tower {
    pub id: String,
    air_temp: Walk,
    humidity: Walk,
    light: Walk,
    vbat: Walk,
    pump_on: bool,
}

impl Tower {
    pub fn new(id: String, rng: &mut impl Rng) -> Self {
        Self {
            id,
            air_temp: Walk::new(rng.gen_range(20.0..26.0), 16.0, 33.0, 0.4),
            humidity: Walk::new(rng.gen_range(50.0..70.0), 35.0, 85.0, 1.5),
            light: Walk::new(rng.gen_range(5_000.0..20_000.0), 0.0, 60_000.0, 800.0),
            vbat: Walk::new(rng.gen_range(3700.0..4100.0), 3350.0, 4200.0, 10.0),
            pump_on: false,
        }
    }

    /// Next reading. With probability `excursion_rate` one value jumps past
    /// an alert threshold for this sample only.
    pub fn sample(&mut self, rng: &mut impl Rng, uptime_s: u64, excursion_rate: f64) -> TowerTelemetry {
        if rng.gen_bool(0.1) {
            self.pump_on = !self.pump_on;
        }
        let mut reading = TowerTelemetry {
            air_temp_c: round(self.air_temp.next(rng), 1),
            humidity_pct: round(self.humidity.next(rng), 1),
            light_lux: round(self.light.next(rng), 0),
            pump_on: self.pump_on,
            light_on: true,
            status_mode: "operational",
            vbat_mv: self.vbat.next(rng) as u32,
            fw_version: FW_VERSION,
            uptime_s,
        };

        if rng.gen_bool(excursion_rate) {
            match rng.gen_range(0..3) {
                0 => reading.air_temp_c = rng.gen_range(36.0..40.0),
                1 => reading.vbat_mv = rng.gen_range(2800..3200),
                _ => reading.status_mode = "error",
            }
        }
        reading
    }
}

pub struct Reservoir {
    ph: Walk,
    ec: Walk,
    water_temp: Walk,
    water_level: Walk,
}

impl Reservoir {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            ph: Walk::new(rng.gen_range(5.8..6.5), 5.6, 7.4, 0.05),
            ec: Walk::new(rng.gen_range(1.6..2.2), 1.2, 2.6, 0.05),
            water_temp: Walk::new(rng.gen_range(19.0..22.0), 16.0, 26.0, 0.2),
            water_level: Walk::new(rng.gen_range(60.0..90.0), 25.0, 100.0, 0.8),
        }
    }

    pub fn sample(
        &mut self,
        rng: &mut impl Rng,
        towers_online: u32,
        uptime_s: u64,
        excursion_rate: f64,
    ) -> ReservoirTelemetry {
        let mut reading = ReservoirTelemetry {
            ph: round(self.ph.next(rng), 2),
            ec_ms_cm: round(self.ec.next(rng), 2),
            water_temp_c: round(self.water_temp.next(rng), 1),
            water_level_pct: round(self.water_level.next(rng), 0),
            main_pump_on: true,
            towers_online,
            status_mode: "operational",
            uptime_s,
        };

        if rng.gen_bool(excursion_rate) {
            match rng.gen_range(0..3) {
                0 => reading.ph = rng.gen_range(8.0..9.0),
                1 => reading.water_level_pct = rng.gen_range(5.0..15.0),
                _ => reading.water_temp_c = rng.gen_range(36.0..38.0),
            }
        }
        reading
    }
}

pub fn random_mac(rng: &mut impl Rng) -> String {
    let bytes: [u8; 6] = rng.gen();
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn round(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}
