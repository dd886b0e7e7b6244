use directories::ProjectDirs;
use kokoki::{init, Context, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;

fn main()
{
    let args: Vec<String> = env::args().collect();
    let mut evaluate_source: Option<String> = None;
    let mut script_path: Option<String> = None;

    let mut idx = 1;
    while idx < args.len()
    {
        match args[idx].as_str()
        {
            "-h" | "--help" =>
            {
                print_usage(&args[0]);
                return;
            }
            "-e" | "--evaluate" =>
            {
                if idx + 1 >= args.len()
                {
                    eprintln!("-e/--evaluate requires a value.");
                    process::exit(1);
                }
                idx += 1;
                evaluate_source = Some(args[idx].clone());
            }
            arg =>
            {
                if script_path.is_some()
                {
                    eprintln!("Unexpected argument: {}", arg);
                    process::exit(1);
                }
                script_path = Some(arg.to_string());
            }
        }
        idx += 1;
    }

    if script_path.is_some() && evaluate_source.is_some()
    {
        eprintln!("Cannot use both -e/--evaluate and a script path.");
        process::exit(1);
    }

    if let Some(path) = script_path
    {
        init(|ctx| run_file(ctx, &path));
    }
    else if let Some(source) = evaluate_source
    {
        init(|ctx| run_source(ctx, &source));
    }
    else
    {
        init(|ctx| {
            if let Err(e) = run_repl(ctx)
            {
                eprintln!("Error: {:?}", e);
                process::exit(1);
            }
        });
    }
}

fn print_usage(bin: &str)
{
    println!(
        "Usage: {bin} [options] [script]
  -h, --help            Show this help
  -e, --evaluate <src>  Evaluate a one-liner
With no arguments an interactive REPL is started."
    );
}

fn run_file(ctx: &mut Context, path: &str)
{
    let source = match fs::read_to_string(path)
    {
        Ok(contents) => contents,
        Err(e) =>
        {
            eprintln!("Error reading file '{}': {}", path, e);
            process::exit(1);
        }
    };
    run_source(ctx, &source);
}

fn run_source(ctx: &mut Context, source: &str)
{
    if let Err(e) = ctx.eval(source)
    {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run_repl(ctx: &mut Context) -> rustyline::Result<()>
{
    println!("Welcome to Korvatunturin Konkatenatiivinen Kieli (kokoki) REPL!");

    let mut rl = DefaultEditor::new()?;
    let history_path = history_file();
    if rl.load_history(&history_path).is_err()
    {}

    loop
    {
        let prompt = format!("kokoki({})> ", ctx.depth());
        match rl.readline(&prompt)
        {
            Ok(line) =>
            {
                let trimmed = line.trim();
                if trimmed.is_empty()
                {
                    continue;
                }
                rl.add_history_entry(line.as_str())?;

                match ctx.eval(&line)
                {
                    // Runtime errors stay on the stack; show the most
                    // recent one instead of a misleading ok.
                    Ok(()) => match ctx.stack.last()
                    {
                        Some(err @ Value::Error(_)) => println!("{}", err.inspect()),
                        _ => println!("  ok"),
                    },
                    Err(e) => println!("{}", e),
                }
            }
            Err(ReadlineError::Interrupted) =>
            {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) =>
            {
                println!("Bye!");
                break;
            }
            Err(err) =>
            {
                println!("Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history(&history_path)
}

fn history_file() -> PathBuf
{
    if let Some(proj_dirs) = ProjectDirs::from("fi", "korvatunturi", "kokoki")
    {
        let data_dir = proj_dirs.data_dir();
        if fs::create_dir_all(data_dir).is_ok()
        {
            return data_dir.join("history.txt");
        }
    }
    PathBuf::from("history.txt")
}
