// Per-hart state and hart registry

pub mod hart;

pub use hart::{
    current_hart, current_task, hart, hart_count, hart_index_of, register_hart, set_current_task,
    Hart, HartId, HART_STACK_SIZE, MAX_HARTS,
};
