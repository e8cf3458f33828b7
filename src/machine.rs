// The machine: owns every device, registers them into the address maps,
// wires the CPU callbacks and runs the step loop. Each executed instruction
// reports its elapsed T-states, which are then distributed to the devices
// that keep time (video raster, flash delays, keyboard shift-out). The
// debug-mode loop additionally consults breakpoints and step requests and
// may idle in the paused state without stepping the CPU.

use crate::bus::{AddressSpace, Bus, MemOps};
use crate::compactflash::CompactFlash;
use crate::debugger::{DbgState, Debugger};
use crate::disasm;
use crate::eeprom::Eeprom;
use crate::flash::{Flash, FlashError, FLASH_SIZE_MAX};
use crate::hostfs::HostFs;
use crate::i2c::I2cBus;
use crate::keyboard::{HostKeys, Keyboard};
use crate::mmu::Mmu;
use crate::pio::PioSubsystem;
use crate::ram::Ram;
use crate::rtc::Rtc;
use crate::vpu::render;
use crate::vpu::sound::SoundSource;
use crate::vpu::vram::Vram;
use crate::vpu::Vpu;
use iz80::Cpu;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;

// Device bases in the two spaces
const FLASH_MEM_BASE: u32 = 0x000000;
const FLASH_MIRROR_BASE: u32 = 0x040000;
const RAM_MEM_BASE: u32 = 0x080000;
const VPU_MEM_BASE: u32 = 0x100000;

const CF_IO_BASE: u8 = 0x70;
const VPU_IO_BASE: u8 = 0x80;
const HOSTFS_IO_BASE: u8 = 0xC0;
const PIO_IO_BASE: u8 = 0xD0;
const KEYBOARD_IO_BASE: u8 = 0xE0;
const MMU_IO_BASE: u8 = 0xF0;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("flash: {0}")]
    Flash(#[from] FlashError),
    #[error("could not mount host filesystem root: {0}")]
    HostFs(std::io::Error),
    #[error("could not load TF card image: {0}")]
    TfImage(std::io::Error),
}

/// Everything the machine needs to come up; paths left empty fall back to
/// blank devices where the hardware allows it.
#[derive(Default)]
pub struct MachineConfig {
    pub rom: Option<PathBuf>,
    /// User program patched into the romdisk, `file[,hexaddr]`.
    pub userprog: Option<String>,
    pub eeprom: Option<PathBuf>,
    pub compactflash: Option<PathBuf>,
    pub tf_image: Option<PathBuf>,
    pub hostfs_root: Option<PathBuf>,
    /// Treat PC returning to 0 as a software reset and exit.
    pub exit_on_pc_zero: bool,
}

pub struct Machine {
    cpu: Cpu,
    bus: Bus,
    space: Rc<AddressSpace>,
    mmu: Rc<RefCell<Mmu>>,
    flash: Rc<RefCell<Flash>>,
    pio: Rc<RefCell<PioSubsystem>>,
    keyboard: Rc<RefCell<Keyboard>>,
    vpu: Rc<RefCell<Vpu>>,
    vram: Rc<RefCell<Vram>>,
    host_keys: HostKeys,
    pub debugger: Debugger,
    dbg_state: DbgState,
    exit_on_pc_zero: bool,
    int_asserted: bool,
    should_exit: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        let space = AddressSpace::new();
        let mmu = Rc::new(RefCell::new(Mmu::new()));
        let ops = MemOps::new(Rc::clone(&space), Rc::clone(&mmu));

        let flash = Rc::new(RefCell::new(Flash::new()));
        if let Some(rom) = &config.rom {
            flash.borrow_mut().load_from_file(rom)?;
        }
        if let Some(userprog) = &config.userprog {
            flash.borrow_mut().override_romdisk(userprog)?;
        }

        let ram = Rc::new(RefCell::new(Ram::new()));
        let vram = Rc::new(RefCell::new(Vram::new()));
        let vpu = Rc::new(RefCell::new(Vpu::new(Rc::clone(&vram), ops.clone())));
        if let Some(tf) = &config.tf_image {
            vpu.borrow_mut().spi.load_tf_image(tf).map_err(MachineError::TfImage)?;
        }

        let mut i2c = I2cBus::new();
        i2c.connect(Box::new(Rtc::new()));
        i2c.connect(Box::new(Eeprom::new(config.eeprom.as_deref())));
        let pio = Rc::new(RefCell::new(PioSubsystem::new(i2c)));

        let keyboard = Rc::new(RefCell::new(Keyboard::new()));

        let hostfs = Rc::new(RefCell::new(HostFs::new(ops.clone())));
        if let Some(root) = &config.hostfs_root {
            hostfs.borrow_mut().mount(root).map_err(MachineError::HostFs)?;
        }

        // Memory space
        space.add_mem_device(FLASH_MEM_BASE, flash.clone()).ok();
        if flash.borrow().size() < FLASH_SIZE_MAX {
            // The smaller part is mirrored in the upper 256KB
            space.add_mem_device(FLASH_MIRROR_BASE, flash.clone()).ok();
        }
        space.add_mem_device(RAM_MEM_BASE, ram).ok();
        space.add_mem_device(VPU_MEM_BASE, vram.clone()).ok();

        // I/O space
        match &config.compactflash {
            Some(image) => match CompactFlash::new(image) {
                Ok(cf) => {
                    space.add_io_device(CF_IO_BASE, Rc::new(RefCell::new(cf))).ok();
                }
                Err(err) => log::warn!("[MACHINE] continuing without CompactFlash: {}", err),
            },
            None => log::warn!("[MACHINE] no CompactFlash image specified"),
        }
        space.add_io_device(VPU_IO_BASE, vpu.clone()).ok();
        space.add_io_device(HOSTFS_IO_BASE, hostfs).ok();
        space.add_io_device(PIO_IO_BASE, pio.clone()).ok();
        space.add_io_device(KEYBOARD_IO_BASE, keyboard.clone()).ok();
        space.add_io_device(MMU_IO_BASE, mmu.clone()).ok();

        let bus = Bus::new(Rc::clone(&space), Rc::clone(&mmu));

        Ok(Machine {
            cpu: Cpu::new_z80(),
            bus,
            space,
            mmu,
            flash,
            pio,
            keyboard,
            vpu,
            vram,
            host_keys: HostKeys::new(),
            debugger: Debugger::new(),
            dbg_state: DbgState::Running,
            exit_on_pc_zero: config.exit_on_pc_zero,
            int_asserted: false,
            should_exit: false,
        })
    }

    /// Reset the CPU and every device that registered a reset handler.
    pub fn reset(&mut self) {
        self.cpu.signal_reset();
        self.host_keys.reset();
        self.space.reset_devices();
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    pub fn request_exit(&mut self) {
        self.should_exit = true;
    }

    pub fn pc(&self) -> u16 {
        self.cpu.immutable_registers().pc()
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.cpu.registers().set_pc(pc);
    }

    pub fn registers(&mut self) -> &mut iz80::Registers {
        self.cpu.registers()
    }

    /// Execute one instruction and distribute the elapsed cycles to the
    /// ticking devices. Returns the elapsed T-states.
    pub fn step(&mut self) -> u64 {
        let before = self.cpu.cycle_count();
        self.cpu.execute_instruction(&mut self.bus);
        let elapsed = self.cpu.cycle_count().wrapping_sub(before);

        if self.exit_on_pc_zero && self.pc() == 0 {
            // PC back at the reset vector: that is a software reset
            log::info!("[MACHINE] PC returned to 0x0000 after running (cyc={}), exiting", self.cpu.cycle_count());
            self.should_exit = true;
            return elapsed;
        }

        self.vpu.borrow_mut().tick(elapsed);
        {
            let mut pio = self.pio.borrow_mut();
            self.keyboard.borrow_mut().tick(&mut pio, elapsed);
        }
        self.flash.borrow_mut().tick(elapsed);

        // Interrupt requests raised by the PIO reach the CPU before the
        // next instruction; the line is released right after.
        if self.pio.borrow_mut().take_interrupt().is_some() {
            self.cpu.signal_interrupt(true);
            self.int_asserted = true;
        } else if self.int_asserted {
            self.cpu.signal_interrupt(false);
            self.int_asserted = false;
        }

        elapsed
    }

    /// One debug-mode iteration: honor pause and step requests, plant the
    /// step-over breakpoint, and stop on breakpoints. Returns the elapsed
    /// T-states (0 while paused).
    pub fn debug_step(&mut self) -> u64 {
        if self.dbg_state == DbgState::Paused {
            return 0;
        }

        if self.dbg_state == DbgState::ReqStepOver {
            let mut opcodes = [0u8; 4];
            let pc = self.pc();
            for (i, b) in opcodes.iter_mut().enumerate() {
                *b = self.debug_mem_read(pc.wrapping_add(i as u16));
            }
            let size = disasm::instruction_size(&opcodes);
            self.debugger.set_temporary_breakpoint(pc.wrapping_add(size as u16));
            self.dbg_state = DbgState::Running;
        }

        let elapsed = self.step();

        let pc = self.pc();
        if self.dbg_state == DbgState::ReqStep || self.debugger.is_breakpoint_set(pc) {
            self.dbg_state = DbgState::Paused;
            self.debugger.clear_breakpoint_if_temporary(pc);
            // Refresh the view while stopped
            self.vpu.borrow_mut().force_render();
        }

        elapsed
    }

    pub fn dbg_state(&self) -> DbgState {
        self.dbg_state
    }

    pub fn set_dbg_state(&mut self, state: DbgState) {
        self.dbg_state = state;
    }

    /// Read memory the debugger way: through the MMU, without advancing
    /// any device state.
    pub fn debug_mem_read(&self, addr: u16) -> u8 {
        self.space.mem_debug_read(self.mmu.borrow().translate(addr))
    }

    pub fn mem_write(&mut self, addr: u16, data: u8) {
        self.space.mem_write(self.mmu.borrow().translate(addr), data);
    }

    pub fn phys_debug_read(&self, addr: u32) -> u8 {
        self.space.mem_debug_read(addr)
    }

    pub fn phys_mem_write(&mut self, addr: u32, data: u8) {
        self.space.mem_write(addr, data);
    }

    /// Advance the video raster clock directly (host-driven timing).
    pub fn tick_video(&mut self, tstates: u64) {
        self.vpu.borrow_mut().tick(tstates);
    }

    pub fn io_write(&mut self, port: u16, data: u8) {
        self.space.io_write(port, data);
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        self.space.io_read(port)
    }

    /// Whether it is time to poll the host for key events.
    pub fn keyboard_poll_due(&mut self, elapsed: u64) -> bool {
        self.keyboard.borrow_mut().check(elapsed)
    }

    /// Feed the currently-down host keys; press/release/repeat become
    /// scan codes in the keyboard FIFO.
    pub fn host_keys_update(&mut self, down: &[minifb::Key], delta: u64) {
        let mut keyboard = self.keyboard.borrow_mut();
        self.host_keys.update(&mut keyboard, down, delta);
    }

    /// Whether the video board reached v-blank and wants a frame out.
    pub fn take_need_render(&mut self) -> bool {
        self.vpu.borrow_mut().take_need_render()
    }

    /// Compose the current frame into a 640x480 host framebuffer.
    pub fn render_frame(&mut self, frame: &mut [u32]) {
        let mut vpu = self.vpu.borrow_mut();
        let vram = self.vram.borrow();
        render::render_frame(&mut vpu, &vram, frame);
    }

    /// The stream source for the host audio output; available once.
    pub fn sound_source(&mut self) -> Option<SoundSource> {
        self.vpu.borrow_mut().sound.take_source()
    }

    /// Dump the flash array to a file if it was modified.
    pub fn save_flash(&self, path: &std::path::Path) -> Result<(), FlashError> {
        self.flash.borrow().save_to_file(path)
    }

    /// Load a default font into the video board font area.
    pub fn load_font(&mut self, data: &[u8]) {
        self.vram.borrow_mut().load_font(data);
    }
}
