// Trap entry and frame save/restore.
//
// sscratch always holds the trap-frame pointer of the context executing on
// this hart. The layout offsets below must match `arch::TrapFrame`:
//   hart  at 0, x1..x31 at 8*i, f0..f31 at 256 + 8*i, pc at 512, satp at 520.

use crate::arch::TrapFrame;
use crate::smp::MAX_HARTS;

pub const TRAP_STACK_SIZE: usize = 16 * 1024;

/// Per-hart stacks used while handling traps. Indexed by the hart index
/// held in `tp`.
#[no_mangle]
static mut TRAP_STACKS: [u8; MAX_HARTS * TRAP_STACK_SIZE] = [0; MAX_HARTS * TRAP_STACK_SIZE];

core::arch::global_asm!(
    r#"
    .section .text
    .altmacro

    .macro save_gp i, base
        sd x\i, (8 * \i)(\base)
    .endm
    .macro load_gp i, base
        ld x\i, (8 * \i)(\base)
    .endm
    .macro save_fp i, base
        fsd f\i, (256 + 8 * \i)(\base)
    .endm
    .macro load_fp i, base
        fld f\i, (256 + 8 * \i)(\base)
    .endm

    .global trap_vector
    .align 4
trap_vector:
    # Swap the frame pointer in; the interrupted t6 parks in sscratch.
    csrrw t6, sscratch, t6
    .set i, 1
    .rept 30
        save_gp %i, t6
        .set i, i + 1
    .endr
    # Recover the interrupted t6 and store it as x31.
    mv t5, t6
    csrrw t6, sscratch, t5
    sd t6, (8 * 31)(t5)
    .set i, 0
    .rept 32
        save_fp %i, t5
        .set i, i + 1
    .endr
    csrr t4, sepc
    sd t4, 512(t5)
    csrr t4, satp
    sd t4, 520(t5)

    # Switch to this hart's trap stack: tp holds the hart index.
    la sp, TRAP_STACKS
    li t3, {trap_stack_size}
    mv t2, tp
    addi t2, t2, 1
    mul t3, t3, t2
    add sp, sp, t3

    mv a0, t5
    call handle_trap
1:  wfi
    j 1b

    .global load_from_frame_asm
    .align 4
load_from_frame_asm:
    ld t0, 520(a0)
    csrw satp, t0
    sfence.vma
    ld t0, 512(a0)
    csrw sepc, t0
    csrw sscratch, a0
    .set i, 0
    .rept 32
        load_fp %i, a0
    .set i, i + 1
    .endr
    .set i, 1
    .rept 9
        load_gp %i, a0
        .set i, i + 1
    .endr
    # skip x10 (a0) until the end
    .set i, 11
    .rept 21
        load_gp %i, a0
        .set i, i + 1
    .endr
    ld x10, (8 * 10)(a0)
    sret

    .global save_to_frame_asm
    .align 4
save_to_frame_asm:
    # setjmp-style: returns 1 now, 0 when the frame is resumed.
    sd ra, (8 * 1)(a0)
    sd sp, (8 * 2)(a0)
    sd gp, (8 * 3)(a0)
    sd tp, (8 * 4)(a0)
    sd s0, (8 * 8)(a0)
    sd s1, (8 * 9)(a0)
    .set i, 18
    .rept 10
        save_gp %i, a0
        .set i, i + 1
    .endr
    sd zero, (8 * 10)(a0)
    sd ra, 512(a0)
    csrr t0, satp
    sd t0, 520(a0)
    li a0, 1
    ret
    "#,
    trap_stack_size = const TRAP_STACK_SIZE,
);

extern "C" {
    fn load_from_frame_asm(frame: *const TrapFrame) -> !;
    fn save_to_frame_asm(frame: *mut TrapFrame) -> usize;
}

/// Restore the given frame and resume it. Never returns.
pub unsafe fn load_from_frame(frame: *const TrapFrame) -> ! {
    load_from_frame_asm(frame)
}

/// Save the current execution state into `frame`. Returns `true`
/// immediately; a later `load_from_frame` of the same frame resumes here
/// returning `false`.
pub unsafe fn save_to_frame(frame: *mut TrapFrame) -> bool {
    save_to_frame_asm(frame) != 0
}

/// Save the current state into `save_to` and continue in `load_from`.
/// Used both for cooperative context switches and for stashing the
/// pre-handler state during signal delivery.
pub unsafe fn swap_trap_frame(load_from: *const TrapFrame, save_to: *mut TrapFrame) {
    if save_to_frame(save_to) {
        load_from_frame(load_from);
    }
}
