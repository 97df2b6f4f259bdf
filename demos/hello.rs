use fanlog::layout::LineLayout;
use fanlog::output::Term;
use fanlog::{log, Level, Logger};

fn main() {
    // A destination combines an output with a layout, a level threshold and
    // an error containment policy; here everything from TRACE up goes to
    // the terminal in the default line format.
    let logger = Logger::new();
    logger
        .handler(Term::stdout())
        .layout(LineLayout)
        .level(Level::TRACE)
        .add()
        .unwrap();

    // Message formatting.
    log!(logger, Level::DEBUG, "{} {} HTTP/1.1 {} {}", "GET", "/static/image.png", 404, 347)
        .unwrap();

    // Attaching additional context information.
    log!(logger, Level::INFO, "nginx/1.6 configured", {
        config: "/etc/nginx/nginx.conf",
        elapsed: 42.15,
    })
    .unwrap();

    log!(logger, Level::WARNING, "client stopped connection before send body completed", {
        host: "::1",
        port: 10053,
    })
    .unwrap();

    // Wait until every queued destination has drained.
    logger.complete().unwrap();
}
