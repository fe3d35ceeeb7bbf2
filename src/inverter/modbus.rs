#![allow(dead_code)]
//! Sungrow residential inverter over Modbus TCP. Power limiting uses
//! the export-power-limit register pair; shutdown drives the start/stop
//! register.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

use super::{InverterController, InverterError};

const REG_START_STOP: u16 = 5006;
const START: u16 = 0xCF;
const STOP: u16 = 0xCE;

const REG_LIMIT_ENABLE: u16 = 5007;
const REG_LIMIT_VALUE: u16 = 5008;
/// Limit register carries tens of watts.
const LIMIT_SCALE: f64 = 10.0;

pub struct SungrowInverter {
    context: Arc<Mutex<tokio_modbus::client::Context>>,
    unit_id: u8,
}

impl SungrowInverter {
    pub async fn connect(addr: &str, unit_id: u8) -> Result<Self, InverterError> {
        let socket_addr = addr
            .parse()
            .map_err(|e| InverterError::Transport(format!("bad inverter address: {}", e)))?;
        let ctx = tcp::connect(socket_addr)
            .await
            .map_err(|e| InverterError::Transport(e.to_string()))?;
        Ok(Self { context: Arc::new(Mutex::new(ctx)), unit_id })
    }

    async fn write(&self, addr: u16, value: u16) -> Result<(), InverterError> {
        let mut ctx = self.context.lock().await;
        ctx.set_slave(Slave(self.unit_id));
        ctx.write_single_register(addr, value)
            .await
            .map_err(|e| InverterError::Transport(e.to_string()))
    }
}

pub fn watts_to_limit_register(watts: f64) -> u16 {
    (watts.max(0.0) / LIMIT_SCALE).round().min(u16::MAX as f64) as u16
}

#[async_trait]
impl InverterController for SungrowInverter {
    async fn set_power_limit(&self, watts: f64) -> Result<(), InverterError> {
        self.write(REG_START_STOP, START).await?;
        self.write(REG_LIMIT_ENABLE, 1).await?;
        self.write(REG_LIMIT_VALUE, watts_to_limit_register(watts)).await
    }

    async fn shutdown(&self) -> Result<(), InverterError> {
        self.write(REG_START_STOP, STOP).await
    }

    async fn restore(&self) -> Result<(), InverterError> {
        self.write(REG_LIMIT_ENABLE, 0).await?;
        self.write(REG_START_STOP, START).await
    }

    fn requires_periodic_reassertion(&self) -> bool {
        true
    }
}
