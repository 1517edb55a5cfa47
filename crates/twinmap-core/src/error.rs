//! Error types for twinmap

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("backing segment: {0}")]
    Backing(String),

    #[error("mapping {len} bytes at {addr:#x} failed: {errno}")]
    Map {
        addr: usize,
        len: usize,
        errno: nix::Error,
    },

    #[error("protection change on {len} bytes at {addr:#x} failed: {errno}")]
    Protect {
        addr: usize,
        len: usize,
        errno: nix::Error,
    },

    #[error("madvise on {len} bytes at {addr:#x} failed: {errno}")]
    Advise {
        addr: usize,
        len: usize,
        errno: nix::Error,
    },

    #[error("initial contents ({got} bytes) exceed region capacity ({capacity} bytes)")]
    InitialTooLarge { got: usize, capacity: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
