use crate::global_variables::INVALID_DOUBLE;
use crate::simulation_engine::control::{ControlConnection, Domain, SubscriptionResults, TraciError};
use crate::simulation_engine::traci_constants::*;
use crate::simulation_engine::traci_storage::{
    get_i32, get_string, get_u8, put_command, put_string, take_command, TraciValue,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

/// Blocking TraCI client over TCP.
pub struct TraciClient {
    stream: TcpStream,
    subscriptions: HashMap<Domain, SubscriptionResults>,
}

impl TraciClient {
    pub fn connect(host: &str, port: u16) -> Result<Self, TraciError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        log::debug!("TraCI connection to {}:{} established", host, port);
        Ok(TraciClient {
            stream,
            subscriptions: HashMap::new(),
        })
    }

    fn send_message(&mut self, commands: &[u8]) -> Result<(), TraciError> {
        let mut message = BytesMut::with_capacity(4 + commands.len());
        message.put_i32((4 + commands.len()) as i32);
        message.put_slice(commands);
        self.stream.write_all(&message)?;
        Ok(())
    }

    fn receive_message(&mut self) -> Result<Bytes, TraciError> {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length)?;
        let length = i32::from_be_bytes(length);
        let body_length = usize::try_from(length - 4)
            .map_err(|_| TraciError::Protocol(format!("invalid message length {}", length)))?;
        let mut body = vec![0u8; body_length];
        self.stream.read_exact(&mut body)?;
        Ok(Bytes::from(body))
    }

    /// Send one command and check its status; returns what follows the status.
    fn exchange(&mut self, command_id: u8, content: &[u8]) -> Result<Bytes, TraciError> {
        let mut commands = BytesMut::new();
        put_command(&mut commands, command_id, content);
        self.send_message(&commands)?;

        let mut response = self.receive_message()?;
        let (status_id, mut status) = take_command(&mut response)?;
        if status_id != command_id {
            return Err(TraciError::Protocol(format!(
                "status for command 0x{:02x} received, expected 0x{:02x}",
                status_id, command_id
            )));
        }
        let result = get_u8(&mut status)?;
        let description = get_string(&mut status)?;
        match result {
            RTYPE_OK => Ok(response),
            RTYPE_NOTIMPLEMENTED | RTYPE_ERR => Err(TraciError::Command {
                command: command_id,
                description,
            }),
            other => Err(TraciError::Protocol(format!(
                "unknown result type 0x{:02x} ({})",
                other, description
            ))),
        }
    }

    fn read_subscription_response(&mut self, buf: &mut Bytes) -> Result<(), TraciError> {
        let (response_id, mut content) = take_command(buf)?;
        let domain = Domain::from_subscription_response(response_id).ok_or_else(|| {
            TraciError::Protocol(format!("unsupported subscription response 0x{:02x}", response_id))
        })?;
        let object_id = get_string(&mut content)?;
        let count = get_u8(&mut content)?;
        let results = self
            .subscriptions
            .entry(domain)
            .or_default()
            .entry(object_id.clone())
            .or_default();
        for _ in 0..count {
            let variable = get_u8(&mut content)?;
            let status = get_u8(&mut content)?;
            let value = TraciValue::read(&mut content)?;
            if status == RTYPE_OK {
                results.insert(variable, value);
            } else {
                log::warn!(
                    "Subscribed variable 0x{:02x} of '{}' failed: {:?}",
                    variable,
                    object_id,
                    value
                );
            }
        }
        Ok(())
    }
}

impl ControlConnection for TraciClient {
    fn get_version(&mut self) -> Result<(i32, String), TraciError> {
        let mut response = self.exchange(CMD_GETVERSION, &[])?;
        let (_, mut content) = take_command(&mut response)?;
        let api = get_i32(&mut content)?;
        let version = get_string(&mut content)?;
        Ok((api, version))
    }

    fn simulation_step(&mut self, target_s: f64) -> Result<(), TraciError> {
        let mut content = BytesMut::new();
        content.put_f64(target_s);
        let mut response = self.exchange(CMD_SIMSTEP, &content)?;

        for results in self.subscriptions.values_mut() {
            results.clear();
        }
        let count = get_i32(&mut response)?;
        for _ in 0..count {
            self.read_subscription_response(&mut response)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TraciError> {
        self.exchange(CMD_CLOSE, &[])?;
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn subscribe(&mut self, domain: Domain, object_id: &str, variables: &[u8]) -> Result<(), TraciError> {
        let mut content = BytesMut::new();
        content.put_f64(INVALID_DOUBLE);
        content.put_f64(INVALID_DOUBLE);
        put_string(&mut content, object_id);
        content.put_u8(variables.len() as u8);
        content.put_slice(variables);
        let mut response = self.exchange(domain.subscribe_command(), &content)?;
        if response.has_remaining() {
            self.read_subscription_response(&mut response)?;
        }
        Ok(())
    }

    fn subscription_results(&self, domain: Domain) -> SubscriptionResults {
        self.subscriptions.get(&domain).cloned().unwrap_or_default()
    }

    fn get_variable(&mut self, domain: Domain, variable: u8, object_id: &str) -> Result<TraciValue, TraciError> {
        let mut content = BytesMut::new();
        content.put_u8(variable);
        put_string(&mut content, object_id);
        let mut response = self.exchange(domain.get_command(), &content)?;

        let (response_id, mut result) = take_command(&mut response)?;
        if response_id != domain.get_command() + GET_RESPONSE_OFFSET {
            return Err(TraciError::Protocol(format!(
                "unexpected get response 0x{:02x}",
                response_id
            )));
        }
        let returned_variable = get_u8(&mut result)?;
        let returned_id = get_string(&mut result)?;
        if returned_variable != variable || returned_id != object_id {
            return Err(TraciError::Protocol(format!(
                "get response for 0x{:02x} of '{}' answers 0x{:02x} of '{}'",
                variable, object_id, returned_variable, returned_id
            )));
        }
        Ok(TraciValue::read(&mut result)?)
    }

    fn set_variable(
        &mut self,
        domain: Domain,
        variable: u8,
        object_id: &str,
        value: TraciValue,
    ) -> Result<(), TraciError> {
        let mut content = BytesMut::new();
        content.put_u8(variable);
        put_string(&mut content, object_id);
        value.write(&mut content);
        self.exchange(domain.set_command(), &content)?;
        Ok(())
    }
}
