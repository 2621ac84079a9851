use std::env;
use viper_vm::{output::SharedBuffer, Vm};
use wasm_bindgen::prelude::*;

#[cfg(feature = "wee_alloc")]
#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

#[wasm_bindgen]
pub fn init() -> String {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    format!(
        "Viper v{} on {} ({}), Copyright (c) {}",
        env!("CARGO_PKG_VERSION"),
        env::consts::OS,
        env::consts::ARCH,
        env!("CARGO_PKG_AUTHORS"),
    )
}

#[wasm_bindgen]
pub struct World {
    vm: Vm,
    // stdout can't be piped into a JS value, so `print` writes here instead
    output: SharedBuffer,
}

impl Default for World {
    fn default() -> Self {
        let output = SharedBuffer::default();
        Self {
            vm: Vm::default().with_output(output.clone()),
            output,
        }
    }
}

#[wasm_bindgen]
impl World {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a snippet against the persistent VM and returns what it printed
    pub fn run(&mut self, src: &str) -> Result<String, String> {
        self.output.take();
        match self.vm.interpret(src) {
            Ok(()) => Ok(self.output.take()),
            Err(e) => {
                // Output printed before a runtime error is still shown
                let printed = self.output.take();
                Err(format!("{printed}{e}").trim().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_captured_per_run() {
        let mut world = World::new();
        assert_eq!(world.run("var a = 1; print a;"), Ok("1\n".to_string()));
        assert_eq!(world.run("print a + 1;"), Ok("2\n".to_string()));
    }

    #[test]
    fn errors_are_reported() {
        let mut world = World::new();
        assert_eq!(
            world.run("print 1;\nprint -null;"),
            Err("1\nOperand must be a number.\n[line 2] in script".to_string())
        );
        assert_eq!(
            world.run("print ;"),
            Err("[line 1] Error at ';': Expect expression.".to_string())
        );
    }
}
