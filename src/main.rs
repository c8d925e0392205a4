use clap::{crate_version, App, Arg};
use h2engine::{Client, Url};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("h2engine")
        .version(crate_version!())
        .about("Fetch a single URL over HTTP/2")
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = Url::parse(matches.value_of("url").expect("missing url")).expect("invalid url");

    let client = Client::default();
    match client.get(&url).await {
        Ok(response) => {
            println!("{}", String::from_utf8_lossy(&response.body));
            if !response.is_success() {
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
