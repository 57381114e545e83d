pub mod memory;
pub mod orion;
