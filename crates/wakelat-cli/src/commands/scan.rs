//! `wakelat scan` — list the requestable C-states of a CPU.

use wakelat_core::cpuidle;

/// Run the scan command. Returns the process exit code.
pub fn run(cpu: u32) -> i32 {
    let states = match cpuidle::read_cpu_cstates(cpu) {
        Ok(states) => states,
        Err(err) => {
            log::error!("{err}");
            return 1;
        }
    };

    if states.is_empty() {
        println!("CPU {cpu} has no requestable C-states");
        return 1;
    }

    println!("Requestable C-states of CPU {cpu}:");
    for state in &states {
        println!(
            "  {:>2}  {:<10}  {}",
            state.index,
            state.name,
            if state.disabled { "disabled" } else { "enabled" }
        );
    }
    0
}
