#![allow(dead_code)]
//! Modbus TCP transport for batteries reachable through an IP gateway.
//!
//! The gateway maps the daily tariff as two 48-register blocks (buy and
//! sell, signed milli-dollars per kWh) plus a handful of control
//! registers. One persistent connection is held for the life of the
//! process; do not construct this repeatedly inside a loop.

use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

use super::{BatteryController, BatteryError};
use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::{
    ExportRule, LiveStatus, OperationMode, SiteInfo, TariffDocument, TariffMetadata,
};

const REG_BUY_BLOCK: u16 = 40001;
const REG_SELL_BLOCK: u16 = 40101;
const REG_OPERATION_MODE: u16 = 40201;
const REG_BACKUP_RESERVE: u16 = 40202;
const REG_EXPORT_RULE: u16 = 40203;
const REG_GRID_CHARGING: u16 = 40204;
const REG_LIVE_BLOCK: u16 = 30001;

/// Rates travel as signed milli-dollars per kWh.
pub fn dollars_to_register(dollars: f64) -> u16 {
    let milli = (dollars * 1000.0).round();
    let clamped = milli.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    clamped as u16
}

pub fn register_to_dollars(register: u16) -> f64 {
    (register as i16) as f64 / 1000.0
}

fn registers_to_i32(high: u16, low: u16) -> i32 {
    let mut bytes = [0u8; 4];
    BigEndian::write_u16(&mut bytes[0..2], high);
    BigEndian::write_u16(&mut bytes[2..4], low);
    BigEndian::read_i32(&bytes)
}

struct ModbusClient {
    context: Arc<Mutex<tokio_modbus::client::Context>>,
    unit_id: u8,
}

impl ModbusClient {
    async fn connect(addr: &str, unit_id: u8) -> Result<Self, BatteryError> {
        let socket_addr = addr
            .parse()
            .map_err(|e| BatteryError::Client(format!("bad gateway address: {}", e)))?;
        let ctx = tcp::connect(socket_addr)
            .await
            .map_err(|e| BatteryError::Transport(e.to_string()))?;
        Ok(Self { context: Arc::new(Mutex::new(ctx)), unit_id })
    }

    async fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, BatteryError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.read_holding_registers(start, count)
            .await
            .map_err(|e| BatteryError::Transport(e.to_string()))
    }

    async fn read_input_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, BatteryError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.read_input_registers(start, count)
            .await
            .map_err(|e| BatteryError::Transport(e.to_string()))
    }

    async fn write_multiple_registers(&self, start: u16, values: &[u16]) -> Result<(), BatteryError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.write_multiple_registers(start, values)
            .await
            .map_err(|e| BatteryError::Transport(e.to_string()))
    }

    async fn write_single_register(&self, addr: u16, value: u16) -> Result<(), BatteryError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.write_single_register(addr, value)
            .await
            .map_err(|e| BatteryError::Transport(e.to_string()))
    }
}

pub struct ModbusBattery {
    client: ModbusClient,
    timezone: String,
}

impl ModbusBattery {
    /// Connect once at startup and reuse the instance.
    pub async fn new(addr: &str, unit_id: u8, timezone: impl Into<String>) -> Result<Self, BatteryError> {
        let client = ModbusClient::connect(addr, unit_id).await?;
        Ok(Self { client, timezone: timezone.into() })
    }

    fn block_words(rates: &std::collections::BTreeMap<String, f64>) -> Vec<u16> {
        (0..SLOTS_PER_DAY)
            .map(|slot| {
                let label = clock::slot_label(slot);
                dollars_to_register(rates.get(&label).copied().unwrap_or(0.0))
            })
            .collect()
    }
}

#[async_trait]
impl BatteryController for ModbusBattery {
    async fn upload_tariff(&self, doc: &TariffDocument) -> Result<(), BatteryError> {
        let buy = Self::block_words(&doc.buy_rates);
        let sell = Self::block_words(&doc.sell_rates);
        self.client.write_multiple_registers(REG_BUY_BLOCK, &buy).await?;
        self.client.write_multiple_registers(REG_SELL_BLOCK, &sell).await?;
        Ok(())
    }

    async fn get_tariff(&self) -> Result<Option<TariffDocument>, BatteryError> {
        let buy = self
            .client
            .read_holding_registers(REG_BUY_BLOCK, SLOTS_PER_DAY as u16)
            .await?;
        let sell = self
            .client
            .read_holding_registers(REG_SELL_BLOCK, SLOTS_PER_DAY as u16)
            .await?;
        let mut doc = TariffDocument {
            metadata: TariffMetadata {
                name: "Gateway Tariff".to_string(),
                utility: "Unknown".to_string(),
                code: "GATEWAY".to_string(),
                currency: "AUD".to_string(),
                daily_charge: 0.0,
                demand_charges: vec![],
            },
            buy_rates: Default::default(),
            sell_rates: Default::default(),
        };
        for slot in 0..SLOTS_PER_DAY {
            let label = clock::slot_label(slot);
            doc.buy_rates.insert(label.clone(), register_to_dollars(buy[slot]));
            doc.sell_rates.insert(label, register_to_dollars(sell[slot]));
        }
        Ok(Some(doc))
    }

    async fn get_site_info(&self) -> Result<SiteInfo, BatteryError> {
        let regs = self.client.read_holding_registers(REG_OPERATION_MODE, 3).await?;
        let operation_mode = match regs[0] {
            1 => OperationMode::Autonomous,
            _ => OperationMode::SelfConsumption,
        };
        let export_rule = match regs[2] {
            0 => Some(ExportRule::Never),
            1 => Some(ExportRule::BatteryOk),
            2 => Some(ExportRule::PvOnly),
            _ => None,
        };
        Ok(SiteInfo {
            operation_mode,
            backup_reserve_percent: regs[1] as f64,
            export_rule,
            timezone: self.timezone.clone(),
        })
    }

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), BatteryError> {
        let value = match mode {
            OperationMode::SelfConsumption => 0,
            OperationMode::Autonomous => 1,
        };
        self.client.write_single_register(REG_OPERATION_MODE, value).await
    }

    async fn set_backup_reserve(&self, percent: f64) -> Result<(), BatteryError> {
        self.client
            .write_single_register(REG_BACKUP_RESERVE, percent.clamp(0.0, 100.0).round() as u16)
            .await
    }

    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), BatteryError> {
        let value = match rule {
            ExportRule::Never => 0,
            ExportRule::BatteryOk => 1,
            ExportRule::PvOnly => 2,
        };
        self.client.write_single_register(REG_EXPORT_RULE, value).await
    }

    async fn set_grid_charging(&self, enabled: bool) -> Result<(), BatteryError> {
        self.client
            .write_single_register(REG_GRID_CHARGING, enabled as u16)
            .await
    }

    async fn get_live_status(&self) -> Result<LiveStatus, BatteryError> {
        let regs = self.client.read_input_registers(REG_LIVE_BLOCK, 9).await?;
        if regs.len() < 9 {
            return Err(BatteryError::Protocol("short live-status block".to_string()));
        }
        Ok(LiveStatus {
            battery_soc: regs[0] as f64 / 10.0,
            grid_power_w: registers_to_i32(regs[1], regs[2]) as f64,
            solar_power_w: registers_to_i32(regs[3], regs[4]) as f64,
            battery_power_w: registers_to_i32(regs[5], regs[6]) as f64,
            load_power_w: registers_to_i32(regs[7], regs[8]) as f64,
            captured_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_scaling_round_trip() {
        for dollars in [-2.0, -0.082, 0.0, 0.25, 1.35, 20.0, 25.0] {
            let reg = dollars_to_register(dollars);
            let back = register_to_dollars(reg);
            assert!((back - dollars).abs() < 0.001, "{} -> {} -> {}", dollars, reg, back);
        }
    }

    #[test]
    fn test_rate_scaling_clamps_to_i16() {
        // 40 $/kWh would overflow the register; clamps instead of wrapping
        let reg = dollars_to_register(40.0);
        assert_eq!(register_to_dollars(reg), i16::MAX as f64 / 1000.0);
    }

    #[test]
    fn test_negative_rates_survive() {
        let reg = dollars_to_register(-0.5);
        assert_eq!(register_to_dollars(reg), -0.5);
    }

    #[test]
    fn test_power_word_combination() {
        assert_eq!(registers_to_i32(0, 4000), 4000);
        assert_eq!(registers_to_i32(0xFFFF, 0xF448), -3000);
    }
}
