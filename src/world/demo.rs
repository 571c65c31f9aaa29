//! Demo recording and playback driver
//!
//! Captures the control-channel traffic of a session so it can be fed
//! back through the client message path later. Driven by the `DEMOREC`,
//! `DEMOPLAY` and `DEMOSTOP` console commands.

use crate::net::PackageMap;
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoMode {
    Recording,
    Playing,
}

/// Optional driver attached to the world while a demo is active
#[derive(Debug)]
pub struct DemoDriver {
    pub name: String,
    pub mode: DemoMode,
    /// Recorded control-channel frames
    pub frames: Vec<Vec<u8>>,
    /// Playback cursor
    pub cursor: usize,
    /// Package map rebuilt during playback
    pub package_map: PackageMap,
}

impl DemoDriver {
    pub fn record(name: &str) -> Self {
        info!("demo recording started: {}", name);
        DemoDriver {
            name: name.to_string(),
            mode: DemoMode::Recording,
            frames: Vec::new(),
            cursor: 0,
            package_map: PackageMap::default(),
        }
    }

    pub fn play(name: &str, frames: Vec<Vec<u8>>) -> Self {
        info!("demo playback started: {}", name);
        DemoDriver {
            name: name.to_string(),
            mode: DemoMode::Playing,
            frames,
            cursor: 0,
            package_map: PackageMap::default(),
        }
    }

    pub fn capture(&mut self, frame: &[u8]) {
        if self.mode == DemoMode::Recording {
            self.frames.push(frame.to_vec());
        }
    }

    /// Next frame to feed through the client control path
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.mode != DemoMode::Playing {
            return None;
        }
        let frame = self.frames.get(self.cursor).cloned();
        if frame.is_some() {
            self.cursor += 1;
        }
        frame
    }

    pub fn stop(self) -> Vec<Vec<u8>> {
        info!("demo stopped: {} ({} frames)", self.name, self.frames.len());
        self.frames
    }
}
