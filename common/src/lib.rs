pub mod cpu_event;
pub mod heap;
pub mod size;
