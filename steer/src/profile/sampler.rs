//! Controller-side rendezvous with the profiled application.
//!
//! The sampler owns every shared-memory region of the profile protocol:
//! the control cell, the thread-progress scratch table, and one profile
//! table per application rank. `initialize` walks the handshake through
//! the mapping phase; `sample` drains steady-state events and, at the end
//! of sampling, runs the region-name exchange.

use std::collections::BTreeMap;

use itertools::Itertools;
use steer_shmem::SharedMemory;

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::profile::control_message::{status, ControlMessage, MAX_NUM_CPU};
use crate::profile::table::{ProfileMessage, ProfileTable, ProfileTableReader};
use crate::region::region_id;

/// Bytes per rank profile table.
pub const TABLE_SIZE: usize = 12288;

/// The controller's half of the profile protocol.
pub struct ProfileSampler {
    ctl_shmem: SharedMemory,
    ctl_msg: ControlMessage,
    tprof_shmem: SharedMemory,
    tables: Vec<(SharedMemory, ProfileTableReader)>,
    shm_prefix: String,
    num_cpu: usize,
    rank_per_node: usize,
    report_name: String,
    profile_name: String,
    region_names: BTreeMap<u64, String>,
    is_name_done: bool,
}

impl ProfileSampler {
    /// Creates the control and thread-progress regions; the application
    /// attaches to them by key.
    pub fn new(env: &Environment, num_cpu: usize) -> Result<ProfileSampler> {
        if num_cpu > MAX_NUM_CPU {
            return Err(Error::Runtime(
                format!("{} CPUs exceed the mapping table limit {}", num_cpu, MAX_NUM_CPU)));
        }
        let ctl_shmem = SharedMemory::create(&env.shm_key("control", None),
                                             ControlMessage::size())?;
        let ctl_msg = unsafe {
            ControlMessage::from_ptr(ctl_shmem.pointer(), true, env.profile_timeout)
        };
        ctl_msg.initialize();
        let tprof_shmem = SharedMemory::create(&env.shm_key("tprof", None), 64 * num_cpu)?;
        Ok(ProfileSampler {
            ctl_shmem,
            ctl_msg,
            tprof_shmem,
            tables: Vec::new(),
            shm_prefix: env.shmkey.clone(),
            num_cpu,
            rank_per_node: 0,
            report_name: String::new(),
            profile_name: String::new(),
            region_names: BTreeMap::new(),
            is_name_done: false,
        })
    }

    /// Walks the mapping phase of the handshake and opens one profile
    /// table per discovered rank. Returns ranks per node.
    pub fn initialize(&mut self) -> Result<usize> {
        self.ctl_msg.wait_peer(status::MAP_END)?;

        let ranks: Vec<i32> = (0..self.num_cpu)
            .map(|cpu| self.ctl_msg.cpu_rank(cpu))
            .filter(|rank| *rank >= 0)
            .sorted_unstable()
            .dedup()
            .collect();
        if ranks.is_empty() {
            return Err(Error::Logic(
                "application ranks were not listed as running on any CPU".into()));
        }

        for rank in &ranks {
            let key = format!("{}-sample-{}", self.shm_prefix, rank);
            let shmem = SharedMemory::create(&key, TABLE_SIZE)?;
            let table = unsafe { ProfileTable::from_ptr(shmem.pointer(), TABLE_SIZE) };
            self.tables.push((shmem, ProfileTableReader::new(table, *rank)));
        }
        self.rank_per_node = ranks.len();

        // Acknowledge the map so the application can attach its tables.
        self.ctl_msg.step_to(status::MAP_END)?;
        self.ctl_msg.wait_peer(status::SAMPLE_BEGIN)?;
        self.ctl_msg.step_to(status::SAMPLE_BEGIN)?;
        Ok(self.rank_per_node)
    }

    /// Ranks discovered during `initialize`.
    pub fn rank_per_node(&self) -> usize {
        self.rank_per_node
    }

    /// Drains every rank's new profile messages, stably ordered by
    /// timestamp (ties keep rank order). Runs the name exchange when the
    /// application has finished sampling.
    pub fn sample(&mut self, into: &mut Vec<ProfileMessage>) -> Result<()> {
        let peer = self.ctl_msg.peer_status();
        if peer < status::SAMPLE_BEGIN || self.is_name_done {
            return Ok(());
        }
        let start = into.len();
        for (_, reader) in &mut self.tables {
            reader.dump(into);
        }
        into[start..].sort_by(|a, b| {
            a.timestamp.partial_cmp(&b.timestamp).unwrap_or(std::cmp::Ordering::Equal)
        });

        if peer >= status::SAMPLE_END {
            self.ctl_msg.step_to(status::SAMPLE_END)?;
            self.exchange_names()?;
        }
        Ok(())
    }

    /// Whether the application has requested shutdown.
    pub fn do_shutdown(&self) -> bool {
        self.ctl_msg.is_shutdown()
    }

    /// The report path the application requested.
    pub fn report_name(&self) -> &str {
        &self.report_name
    }

    /// The application's profile name.
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Region names learned in the exchange, keyed by region id.
    pub fn region_names(&self) -> &BTreeMap<u64, String> {
        &self.region_names
    }

    /// Unlinks every region this sampler created, ahead of drop, so a
    /// fatal exit leaves no keys behind.
    pub fn unlink(&mut self) {
        let _ = self.ctl_shmem.unlink();
        let _ = self.tprof_shmem.unlink();
        for (shmem, _) in &mut self.tables {
            let _ = shmem.unlink();
        }
    }

    /// Reads the `report\0profile\0name...\0\0` blob each rank wrote over
    /// its table at the end of sampling.
    fn exchange_names(&mut self) -> Result<()> {
        self.ctl_msg.wait_peer(status::NAME_END)?;
        for (shmem, reader) in &self.tables {
            let bytes = unsafe {
                std::slice::from_raw_parts(shmem.pointer() as *const u8, TABLE_SIZE)
            };
            let mut names = Vec::new();
            let mut begin = 0;
            while begin < bytes.len() {
                let end = begin
                    + bytes[begin..].iter().position(|b| *b == 0)
                        .unwrap_or(bytes.len() - begin);
                if end == begin {
                    break;
                }
                names.push(String::from_utf8_lossy(&bytes[begin..end]).into_owned());
                begin = end + 1;
            }
            if names.len() < 2 {
                return Err(Error::Runtime(
                    format!("rank {} wrote a malformed name table", reader.rank())));
            }
            if self.report_name.is_empty() {
                self.report_name = names[0].clone();
                self.profile_name = names[1].clone();
            }
            for name in &names[2..] {
                self.region_names.insert(region_id(name), name.clone());
            }
        }
        self.ctl_msg.step_to(status::NAME_END)?;
        self.is_name_done = true;
        Ok(())
    }
}
