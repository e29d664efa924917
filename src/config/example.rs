//! Example config printed by `--example`

pub const EXAMPLE_YAML: &str = r#"# loadtool example config
pools:
  - id: http-pool
    ammo:
      type: uri
      file: ./ammo.uri
      limit: 10000          # 0 = unlimited
      passes: 0             # 0 = loop forever
      headers:
        - "[User-Agent: loadtool]"
    result:
      type: phout
      destination: ./phout.log
    gun:
      type: http
      target: localhost:8080
      timeout: 5s
    rps:
      - {type: line, from: 1, to: 100, duration: 30s}
      - {type: const, ops: 100, duration: 2m}
    startup:
      type: once
      times: 50

  - id: scenario-pool
    ammo:
      type: http/scenario
      file: ./scenario.yaml
    result:
      type: log
    gun:
      type: http/scenario
      target: localhost:8080
    rps: {type: unlimited, duration: 1m}
    startup: {type: instance_step, from: 1, to: 10, step: 1, step_duration: 5s}
    rps-per-instance: false
    discard_overflow: false

log:
  level: info

monitoring:
  expvar:
    enabled: false
    port: 1234
"#;
