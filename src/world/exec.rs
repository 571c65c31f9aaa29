//! Console command dispatch
//!
//! A handful of commands are handled at the world level. Unrecognized
//! commands return false so the caller can forward them.

use crate::world::demo::DemoDriver;
use crate::world::World;
use log::{info, warn};

impl World {
    /// Dispatch one console command line. Returns whether it was handled.
    pub fn exec(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command.to_ascii_uppercase(),
            None => return false,
        };
        let rest: Vec<&str> = parts.collect();

        match command.as_str() {
            "DEMOREC" => {
                let name = rest.first().copied().unwrap_or("demo");
                if self.demo_driver.is_some() {
                    warn!("demo driver already active");
                } else {
                    self.demo_driver = Some(DemoDriver::record(name));
                }
                true
            }
            "DEMOPLAY" => match rest.first() {
                Some(name) => {
                    if self.demo_driver.is_some() {
                        warn!("demo driver already active");
                    } else {
                        self.demo_driver = Some(DemoDriver::play(name, Vec::new()));
                    }
                    true
                }
                None => {
                    warn!("DEMOPLAY requires a demo name");
                    true
                }
            },
            "DEMOSTOP" => {
                if let Some(driver) = self.demo_driver.take() {
                    driver.stop();
                }
                true
            }
            "SHOWEXTENTLINECHECK" => {
                self.show_extent_line_checks = !self.show_extent_line_checks;
                info!("extent line check rendering: {}", self.show_extent_line_checks);
                true
            }
            "SHOWLINECHECK" => {
                self.show_line_checks = !self.show_line_checks;
                info!("line check rendering: {}", self.show_line_checks);
                true
            }
            "SHOWPOINTCHECK" => {
                self.show_point_checks = !self.show_point_checks;
                info!("point check rendering: {}", self.show_point_checks);
                true
            }
            "FLUSHPERSISTENTDEBUGLINES" => {
                self.renderer.flush_persistent_debug_lines();
                true
            }
            "LOGACTORCOUNTS" => {
                let (total, tickable) = self.actor_counts();
                info!(
                    "actor counts: {} total across {} levels, {} tickable",
                    total,
                    self.levels.len(),
                    tickable
                );
                true
            }
            "PEER" => match self.peer_net_driver.as_mut() {
                Some(driver) => driver.exec(&rest.join(" ")),
                None => {
                    warn!("no peer net driver");
                    true
                }
            },
            _ => false,
        }
    }
}
