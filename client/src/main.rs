use clap::Parser;
use client::CanvasClient;
use log::info;
use shared::{CanvasState, Color, Packet, Reject};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the canvas server
    #[arg(short, long, default_value = "ws://127.0.0.1:3001")]
    url: String,

    /// Paint one cell: grid, row, col
    #[arg(long, num_args = 3, value_names = ["GRID", "ROW", "COL"])]
    paint: Option<Vec<u32>>,

    /// Color used with --paint
    #[arg(long, default_value = "#000000")]
    color: String,

    /// Reset every cell of every grid to white
    #[arg(long)]
    clear: bool,

    /// Keep the connection open and print the leaderboard on every update
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let color: Color = args.color.parse()?;

    let mut canvas_client = CanvasClient::connect(&args.url).await?;
    info!("Session {} established", canvas_client.session_id());
    print_leaderboard(canvas_client.canvas());

    if args.clear {
        canvas_client.clear().await?;
        await_outcome(&mut canvas_client, "Canvas cleared!").await?;
    }

    if let Some(cell) = &args.paint {
        canvas_client.paint(cell[0], cell[1], cell[2], color).await?;
        await_outcome(&mut canvas_client, "Pixel painted!").await?;
    }

    if args.watch {
        loop {
            match canvas_client.next_packet().await? {
                Packet::Grid { canvas } => print_leaderboard(&canvas),
                Packet::Rejected { reason } => println!("Rejected: {}", reason),
                Packet::Disconnected { reason } => {
                    println!("Disconnected by server: {}", reason);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    canvas_client.disconnect().await?;
    Ok(())
}

/// Waits for the response to our own action: either the canvas broadcast
/// that includes it, or a rejection.
async fn await_outcome(
    canvas_client: &mut CanvasClient,
    success: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match canvas_client.next_packet().await? {
            Packet::Grid { canvas } => {
                println!("{}", success);
                print_leaderboard(&canvas);
                return Ok(());
            }
            Packet::Rejected {
                reason: Reject::Cooldown { remaining_ms },
            } => {
                println!(
                    "Sorry! Please wait {:.1} seconds.",
                    remaining_ms as f64 / 1000.0
                );
                return Ok(());
            }
            Packet::Rejected { reason } => {
                println!("Rejected: {}", reason);
                return Ok(());
            }
            _ => {}
        }
    }
}

fn print_leaderboard(canvas: &CanvasState) {
    let board = canvas.leaderboard();
    if board.is_empty() {
        println!("Canvas is blank");
        return;
    }
    println!("Hex Code Leaderboard");
    for (color, count) in board {
        println!("  {}: {}", color, count);
    }
}
