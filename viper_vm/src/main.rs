use std::{
    env, fs,
    io::{self, Write},
    process,
};
use viper_vm::{GcConfig, InterpretError, Vm};

// Exit codes follow sysexits.h
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

fn main() {
    pretty_env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() > 1 {
        eprintln!("Usage: viper [script]");
        process::exit(EX_USAGE);
    }
    let mut vm = Vm::new(GcConfig::from_env());
    if args.is_empty() {
        run_repl(&mut vm);
    } else {
        run_file(&mut vm, &args[0]);
    }
}

fn run_repl(vm: &mut Vm) {
    let (stdin, mut stdout) = (io::stdin(), io::stdout());
    loop {
        let mut line = String::default();
        print!(">>> ");
        if let Err(e) = stdout.flush() {
            eprintln!("Failed to flush stdout: {e}");
            process::exit(EX_IOERR);
        }
        match stdin.read_line(&mut line) {
            // Zero bytes means end of input, usually Ctrl-D
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Failed to read line: {e}");
                process::exit(EX_IOERR);
            }
        }
        // Globals persist between lines, errors do not end the session
        if let Err(e) = vm.interpret(&line) {
            eprintln!("{e}");
        }
    }
}

fn run_file(vm: &mut Vm, file_path: &str) {
    let source = match fs::read_to_string(file_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read file \"{file_path}\": {e}");
            process::exit(EX_IOERR);
        }
    };
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(e @ InterpretError::Compile(_)) => {
            eprintln!("{e}");
            process::exit(EX_DATAERR);
        }
        Err(e @ InterpretError::Runtime(_)) => {
            eprintln!("{e}");
            process::exit(EX_SOFTWARE);
        }
    }
}
