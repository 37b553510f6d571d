//! Demo driver: assembles a tiny in-memory game and runs it through the
//! interpreter.

use clap::Parser;
use log::info;

use scivm::{
    loader::{MemoryLoader, ObjectBlob, ScriptBlob, ScriptBuilder},
    make_reg,
    vm::VmState,
};

#[derive(Parser)]
#[command(name = "scivm", about = "SCI-style bytecode interpreter demo")]
struct Args {
    /// log filter, e.g. "debug" or "scivm=trace"
    #[arg(long, default_value = "info")]
    log: String,
    /// trace every executed instruction
    #[arg(long)]
    trace: bool,
    /// kernel calls between garbage collections
    #[arg(long)]
    gc_interval: Option<u32>,
}

/// A one-script game whose `play` method computes 5! iteratively and
/// leaves it in the accumulator and global 0.
fn demo_game() -> MemoryLoader {
    let mut code = ScriptBuilder::new();

    let play = code.here();
    code.link(2); // temp0 = counter, temp1 = result
    code.ldi(1).sat(1);
    code.ldi(5).sat(0);
    let loop_top = code.here();
    code.lat(0);
    let exit_branch = code.here() + 1;
    code.bnt(0); // patched below
    code.var_access(0x46, 1); // push temp1
    code.lat(0);
    code.mul();
    code.sat(1);
    code.var_access(0x72, 0); // --temp0
    let after_jmp = code.here() + 3;
    code.jmp(loop_top as i16 - after_jmp as i16);
    let exit = code.here();
    code.patch_word(exit_branch, exit - (exit_branch + 2));
    code.lat(1);
    code.sag(0);
    code.ret();

    let mut loader = MemoryLoader::new();
    loader.set_selectors(&["species", "superClass", "-info-", "name", "play"]);
    let blob = ScriptBlob {
        bytecode: code.finish(),
        exports: Vec::new(),
        objects: vec![ObjectBlob::new(0x100, "demoGame", 0, 0xFFFF, 0).with_method(4, play)],
        locals: vec![make_reg(0, 0); 4],
    };
    loader.add_script(0, blob);
    loader.set_game_object(0, 0x100);
    loader
}

fn main() {
    let args = Args::parse();
    let filter = if args.trace {
        "trace".to_owned()
    } else {
        args.log.clone()
    };
    env_logger::Builder::new().parse_filters(&filter).init();

    let mut state = VmState::new(Box::new(demo_game()));
    if let Some(interval) = args.gc_interval {
        state.gc_interval = interval;
        state.gc_countdown = interval;
    }
    state.run_game();
    info!("game finished, acc = {:?}", state.r_acc);
}
