//! Classification of intercepted requests into serving strategies.

use std::collections::HashSet;
use url::Url;

use crate::net::{Destination, Request};

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; left to default network handling
  Passthrough,
  /// Cache-first
  Static,
  /// Stale-while-revalidate
  Image,
  /// Network-first
  Default,
}

/// Decides which strategy handles a request.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  /// Paths of same-origin static assets
  asset_paths: HashSet<String>,
  /// Full URLs (without fragment) of every static asset
  asset_urls: HashSet<String>,
  allowed_hosts: Vec<String>,
}

impl Router {
  pub fn new(origin: Url, static_assets: &[Url], allowed_hosts: &[String]) -> Self {
    let asset_paths = static_assets
      .iter()
      .filter(|u| u.origin() == origin.origin())
      .map(|u| u.path().to_string())
      .collect();

    let asset_urls = static_assets.iter().map(without_fragment).collect();

    Self {
      origin,
      asset_paths,
      asset_urls,
      allowed_hosts: allowed_hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
    }
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Host equals an allow-listed host or is a subdomain of one.
  fn is_allowed_host(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_ascii_lowercase();
    self
      .allowed_hosts
      .iter()
      .any(|allowed| host == *allowed || host.ends_with(&format!(".{}", allowed)))
  }

  fn is_static_asset(&self, url: &Url) -> bool {
    (self.is_same_origin(url) && self.asset_paths.contains(url.path()))
      || self.asset_urls.contains(&without_fragment(url))
  }

  /// Pick the serving strategy for a request.
  ///
  /// Only GET is intercepted, including for allow-listed hosts: a non-GET
  /// request to a CDN or font host passes through like any other.
  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_get() {
      return Route::Passthrough;
    }

    let allowed_host = self.is_allowed_host(&request.url);
    if !self.is_same_origin(&request.url) && !allowed_host {
      return Route::Passthrough;
    }

    if allowed_host || self.is_static_asset(&request.url) {
      Route::Static
    } else if request.destination == Destination::Image {
      Route::Image
    } else {
      Route::Default
    }
  }
}

fn without_fragment(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn router() -> Router {
    let origin = Url::parse("https://biblia.example/").unwrap();
    let assets: Vec<Url> = ["./", "./index.html", "./css/estilo.css", "./favicon.svg"]
      .iter()
      .map(|a| origin.join(a).unwrap())
      .chain(std::iter::once(
        Url::parse("https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css")
          .unwrap(),
      ))
      .collect();
    let hosts = vec![
      "cdn.jsdelivr.net".to_string(),
      "fonts.googleapis.com".to_string(),
      "fonts.gstatic.com".to_string(),
    ];
    Router::new(origin, &assets, &hosts)
  }

  fn req(url: &str, destination: Destination) -> Request {
    Request::parse(url, destination).unwrap()
  }

  #[test]
  fn test_static_assets_by_path() {
    let r = router();
    assert_eq!(r.classify(&req("https://biblia.example/", Destination::Document)), Route::Static);
    assert_eq!(
      r.classify(&req("https://biblia.example/css/estilo.css?v=2", Destination::Style)),
      Route::Static
    );
    // Static path beats image destination
    assert_eq!(
      r.classify(&req("https://biblia.example/favicon.svg", Destination::Image)),
      Route::Static
    );
  }

  #[test]
  fn test_allowed_hosts_are_static() {
    let r = router();
    assert_eq!(
      r.classify(&req("https://fonts.gstatic.com/s/roboto.woff2", Destination::Font)),
      Route::Static
    );
    assert_eq!(
      r.classify(&req("https://cdn.jsdelivr.net/npm/other.js", Destination::Script)),
      Route::Static
    );
  }

  #[test]
  fn test_images_and_default() {
    let r = router();
    assert_eq!(
      r.classify(&req("https://biblia.example/img/moses.jpg", Destination::Image)),
      Route::Image
    );
    assert_eq!(
      r.classify(&req("https://biblia.example/versiculos.html", Destination::Document)),
      Route::Default
    );
  }

  #[test]
  fn test_passthrough() {
    let r = router();
    assert_eq!(
      r.classify(&req("https://tracker.example/pixel.gif", Destination::Image)),
      Route::Passthrough
    );
    // Lookalike host is not allow-listed
    assert_eq!(
      r.classify(&req("https://evilcdn.jsdelivr.net.example/x.js", Destination::Script)),
      Route::Passthrough
    );

    let post = Request::new(
      "POST",
      Url::parse("https://biblia.example/feedback").unwrap(),
      Destination::Other,
    );
    assert_eq!(r.classify(&post), Route::Passthrough);
    let cdn_post = Request::new(
      "POST",
      Url::parse("https://cdn.jsdelivr.net/x").unwrap(),
      Destination::Other,
    );
    assert_eq!(r.classify(&cdn_post), Route::Passthrough);
  }
}
